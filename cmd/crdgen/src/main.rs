use m3dbop_cluster::crd::M3dbCluster;

use kube::CustomResourceExt;

fn main() {
    for crd in vec![M3dbCluster::crd()] {
        // safe unwrap: we know CRD is serializable
        print!("---\n{}\n", serde_yaml::to_string(&crd).unwrap());
    }
}
