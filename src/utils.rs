use url::Url;

/// Last non-empty path segment of the URL, if it has one.
pub fn get_filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_from_url_path() {
        assert_eq!(
            get_filename_from_url("http://images.cocodataset.org/zips/val2017.zip").as_deref(),
            Some("val2017.zip")
        );
        assert_eq!(get_filename_from_url("http://example.com/"), None);
        assert_eq!(get_filename_from_url("not a url"), None);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize_filename("a b/c?.zip"), "a_b_c_.zip");
    }
}
