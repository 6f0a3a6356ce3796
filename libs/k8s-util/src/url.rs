/// Collapse path segments that look like resource names into a fixed placeholder so that HTTP
/// client metrics don't explode cardinality with one label value per object name.
///
/// Segments following `namespaces`, or any segment that isn't a known API group/version/resource
/// keyword, are replaced by `{name}` when `name` is `None`, or left untouched otherwise.
pub fn template_path(path: &str, name: Option<&str>) -> String {
    const KEYWORDS: &[&str] = &[
        "api", "apis", "namespaces", "watch", "status", "scale", "finalize",
    ];

    path.split('/')
        .map(|segment| {
            if segment.is_empty() || KEYWORDS.contains(&segment) || segment.contains('.') {
                segment.to_string()
            } else if name.is_some_and(|n| n == segment) {
                segment.to_string()
            } else {
                "{name}".to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod test {
    use super::template_path;

    #[test]
    fn test_template_path_collapses_names() {
        assert_eq!(
            template_path("/apis/m3db.io/v1alpha1/namespaces/default/m3dbclusters/prod", None),
            "/apis/m3db.io/v1alpha1/namespaces/{name}/{name}/{name}"
        );
    }

    #[test]
    fn test_template_path_keeps_matching_name() {
        assert_eq!(
            template_path("/apis/apps/v1/namespaces/default/statefulsets/prod-g1", Some("prod-g1")),
            "/apis/apps/v1/namespaces/{name}/{name}/prod-g1"
        );
    }
}
