//! Attachment-type classification shared by send validation and rendering.

use std::collections::HashSet;

pub const DEFAULT_ALLOWED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "pdf", "doc", "docx", "xls", "xlsx", "txt",
];
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Document,
}

#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    allowed: HashSet<String>,
    images: HashSet<String>,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_ALLOWED_EXTENSIONS.iter().copied(),
            DEFAULT_IMAGE_EXTENSIONS.iter().copied(),
        )
    }
}

impl AttachmentPolicy {
    pub fn new<A, I, S, T>(allowed: A, images: I) -> Self
    where
        A: IntoIterator<Item = S>,
        I: IntoIterator<Item = T>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let normalize = |ext: &str| ext.trim().trim_start_matches('.').to_ascii_lowercase();
        Self {
            allowed: allowed
                .into_iter()
                .map(|ext| normalize(ext.as_ref()))
                .collect(),
            images: images
                .into_iter()
                .map(|ext| normalize(ext.as_ref()))
                .collect(),
        }
    }

    /// Lowercased extension of `file_name`, if it has one.
    pub fn extension(file_name: &str) -> Option<String> {
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    pub fn is_allowed(&self, file_name: &str) -> bool {
        Self::extension(file_name).is_some_and(|ext| self.allowed.contains(&ext))
    }

    /// Image-vs-document decision. A mime type wins over the extension.
    pub fn classify(&self, file_name: &str, mime_type: Option<&str>) -> AttachmentKind {
        if let Some(mime) = mime_type {
            if mime.to_ascii_lowercase().starts_with("image/") {
                return AttachmentKind::Image;
            }
            if !mime.trim().is_empty() && mime != "application/octet-stream" {
                return AttachmentKind::Document;
            }
        }
        match Self::extension(file_name) {
            Some(ext) if self.images.contains(&ext) => AttachmentKind::Image,
            _ => AttachmentKind::Document,
        }
    }

    pub fn is_image(&self, file_name: &str, mime_type: Option<&str>) -> bool {
        self.classify(file_name, mime_type) == AttachmentKind::Image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_is_case_insensitive() {
        let policy = AttachmentPolicy::default();
        assert!(policy.is_allowed("scan.PDF"));
        assert!(policy.is_allowed("ultrasound.Jpeg"));
        assert!(!policy.is_allowed("installer.exe"));
        assert!(!policy.is_allowed("noextension"));
        assert!(!policy.is_allowed(".png"));
    }

    #[test]
    fn mime_type_overrides_extension() {
        let policy = AttachmentPolicy::default();
        assert_eq!(
            policy.classify("report.bin", Some("image/png")),
            AttachmentKind::Image
        );
        assert_eq!(
            policy.classify("photo.png", Some("application/pdf")),
            AttachmentKind::Document
        );
        assert_eq!(
            policy.classify("photo.png", Some("application/octet-stream")),
            AttachmentKind::Image
        );
    }

    #[test]
    fn custom_lists_accept_dotted_entries() {
        let policy = AttachmentPolicy::new([".heic", "pdf"], [".heic"]);
        assert!(policy.is_allowed("IMG_0001.HEIC"));
        assert!(policy.is_image("IMG_0001.HEIC", None));
        assert!(!policy.is_allowed("notes.txt"));
    }
}
