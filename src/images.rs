//! Pinned image versions loaded from `image-versions.yaml`

use crate::error::ImageError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Default location of the image version file, relative to the working directory
pub const DEFAULT_IMAGE_FILE: &str = "image-versions.yaml";

/// Image references keyed by service
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ImageVersions {
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

impl ImageVersions {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ImageError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ImageError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Image reference pinned for `key`
    pub fn image(&self, key: &str) -> Result<&str, ImageError> {
        self.images
            .get(key)
            .map(String::as_str)
            .filter(|image| !image.is_empty())
            .ok_or_else(|| ImageError::Unknown(key.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) const SAMPLE: &str = r#"
images:
  whoami: traefik/whoami:v1.10
  linkwarden: ghcr.io/linkwarden/linkwarden:v2.9.3
  miniflux: miniflux/miniflux:2.2.6
  beszel: henrygd/beszel:0.10.2
  beszel-agent: henrygd/beszel-agent:0.10.2
"#;

    pub(crate) fn sample_images() -> ImageVersions {
        ImageVersions::from_yaml(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_image_versions() {
        let images = sample_images();
        assert_eq!(images.images.len(), 5);
        assert_eq!(images.image("whoami").unwrap(), "traefik/whoami:v1.10");
        assert_eq!(
            images.image("beszel-agent").unwrap(),
            "henrygd/beszel-agent:0.10.2"
        );
    }

    #[test]
    fn test_unknown_image_key() {
        let err = sample_images().image("jellyfin").unwrap_err();
        assert!(matches!(err, ImageError::Unknown(key) if key == "jellyfin"));
    }

    #[test]
    fn test_empty_image_reference_is_unknown() {
        let images = ImageVersions::from_yaml("images:\n  whoami: \"\"\n").unwrap();
        assert!(images.image("whoami").is_err());
    }

    #[test]
    fn test_missing_images_section() {
        let images = ImageVersions::from_yaml("{}").unwrap();
        assert!(images.images.is_empty());
    }

    #[test]
    fn test_invalid_yaml() {
        let err = ImageVersions::from_yaml("images: [whoami").unwrap_err();
        assert!(matches!(err, ImageError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let images = ImageVersions::load(file.path()).unwrap();
        assert_eq!(images, sample_images());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ImageVersions::load(dir.path().join("image-versions.yaml")).unwrap_err();
        assert!(matches!(err, ImageError::Read { .. }));
    }
}
