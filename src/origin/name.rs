const INDEX_SEGMENTS: [&str; 2] = ["index.htm", "index.html"];

/// The method an endpoint name routes to. `Bare` is the single
/// subscription used when HTTP-method routing is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Options,
    Head,
    Get,
    Put,
    Post,
    Bare,
}

impl EndpointKind {
    pub fn tag(self) -> &'static str {
        match self {
            EndpointKind::Options => "options",
            EndpointKind::Head => "head",
            EndpointKind::Get => "get",
            EndpointKind::Put => "put",
            EndpointKind::Post => "post",
            EndpointKind::Bare => "",
        }
    }

    pub const READS: [EndpointKind; 3] =
        [EndpointKind::Options, EndpointKind::Head, EndpointKind::Get];
}

/// Composes the endpoint name for a logical filename and method. Index
/// aliases end with `/` (or are empty for the root), so the method tag
/// attaches without doubling the separator.
pub fn endpoint_name(filename: &str, kind: EndpointKind) -> String {
    match kind {
        EndpointKind::Bare => filename.to_string(),
        _ if filename.is_empty() || filename.ends_with('/') => {
            format!("{filename}{}", kind.tag())
        }
        _ => format!("{filename}/{}", kind.tag()),
    }
}

/// When the last path segment is an index file, the directory name itself
/// (filename minus the index segment; empty for the root) aliases the same
/// record.
pub fn index_alias(filename: &str) -> Option<String> {
    let segment = match filename.rfind('/') {
        Some(pos) => &filename[pos + 1..],
        None => filename,
    };
    if INDEX_SEGMENTS.contains(&segment) {
        Some(filename[..filename.len() - segment.len()].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_names_append_a_tag_segment() {
        assert_eq!(endpoint_name("a.txt", EndpointKind::Get), "a.txt/get");
        assert_eq!(endpoint_name("d/a.txt", EndpointKind::Put), "d/a.txt/put");
    }

    #[test]
    fn bare_names_are_unchanged() {
        assert_eq!(endpoint_name("a.txt", EndpointKind::Bare), "a.txt");
    }

    #[test]
    fn alias_names_do_not_double_the_separator() {
        assert_eq!(endpoint_name("docs/", EndpointKind::Get), "docs/get");
        assert_eq!(endpoint_name("", EndpointKind::Head), "head");
    }

    #[test]
    fn index_files_alias_their_directory() {
        assert_eq!(index_alias("docs/index.html"), Some("docs/".to_string()));
        assert_eq!(index_alias("docs/index.htm"), Some("docs/".to_string()));
        assert_eq!(index_alias("index.html"), Some(String::new()));
        assert_eq!(index_alias("docs/page.html"), None);
        assert_eq!(index_alias("docs/xindex.html"), None);
    }
}
