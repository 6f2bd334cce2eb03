//! Minimal tag scanner for backend list/commit response bodies.
//!
//! The listing bodies both dialects return are flat XML; pulling the text of
//! one repeated element is all the capability set needs, so this scans for
//! `<Tag>...</Tag>` pairs instead of carrying a full XML parser.

/// Returns the text content of every `<tag>...</tag>` occurrence, in order.
pub(crate) fn values_of(body: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = body;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find(&close) {
            Some(end) => {
                out.push(after[..end].to_string());
                rest = &after[end + close.len()..];
            }
            None => break,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_repeated_tags_in_order() {
        let body = "<EnumerationResults><Blobs>\
                    <Blob><Name>a/one.bin</Name></Blob>\
                    <Blob><Name>a/two.bin</Name></Blob>\
                    </Blobs></EnumerationResults>";
        assert_eq!(values_of(body, "Name"), vec!["a/one.bin", "a/two.bin"]);
    }

    #[test]
    fn s3_listing_keys() {
        let body = "<ListBucketResult>\
                    <Contents><Key>img/disk.raw</Key></Contents>\
                    <Contents><Key>img/disk.raw.sha</Key></Contents>\
                    </ListBucketResult>";
        assert_eq!(
            values_of(body, "Key"),
            vec!["img/disk.raw", "img/disk.raw.sha"]
        );
    }

    #[test]
    fn missing_tag_yields_empty() {
        assert!(values_of("<A>x</A>", "B").is_empty());
    }

    #[test]
    fn unterminated_tag_stops_cleanly() {
        assert_eq!(values_of("<Name>ok</Name><Name>trunc", "Name"), vec!["ok"]);
    }
}
