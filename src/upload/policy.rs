use crate::upload::types::{AssetKind, FileDescriptor};
use thiserror::Error;

/// A file failed the local upload rules. Local only: validation never
/// touches the network, and only the first violated rule is reported so the
/// UI can show one actionable message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file is {actual_bytes} bytes, the limit for this asset is {limit_bytes} bytes")]
    TooLarge { actual_bytes: u64, limit_bytes: u64 },
    #[error("format '{format}' is not accepted for this asset (accepted: {accepted})")]
    UnacceptedFormat { format: String, accepted: String },
    #[error("duration {actual_seconds}s exceeds the {limit_seconds}s limit")]
    TooLong {
        actual_seconds: u32,
        limit_seconds: u32,
    },
}

/// Static upload rules for one asset kind.
#[derive(Debug, Clone)]
pub struct UploadRequirement {
    pub max_size_bytes: u64,
    pub max_duration_seconds: Option<u32>,
    /// Accepted MIME types and file extensions, lowercase.
    pub accepted_formats: &'static [&'static str],
    /// Human-readable requirement lines shown next to the file picker.
    pub descriptors: &'static [&'static str],
}

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

static MAIN_REQUIREMENT: UploadRequirement = UploadRequirement {
    max_size_bytes: GIB,
    max_duration_seconds: Some(900),
    accepted_formats: &["video/mp4", "video/quicktime", "mp4", "mov"],
    descriptors: &["MP4 or MOV video", "Up to 1 GB", "Up to 15 minutes"],
};

static TRAILER_REQUIREMENT: UploadRequirement = UploadRequirement {
    max_size_bytes: 200 * MIB,
    max_duration_seconds: Some(120),
    accepted_formats: &["video/mp4", "video/quicktime", "mp4", "mov"],
    descriptors: &["MP4 or MOV video", "Up to 200 MB", "Up to 2 minutes"],
};

static THUMBNAIL_REQUIREMENT: UploadRequirement = UploadRequirement {
    max_size_bytes: 10 * MIB,
    max_duration_seconds: None,
    accepted_formats: &["image/jpeg", "image/png", "image/webp", "jpg", "jpeg", "png", "webp"],
    descriptors: &["JPEG, PNG or WebP image", "Up to 10 MB"],
};

/// Requirement table entry for an asset kind. Static, loaded once, never
/// mutated at runtime.
pub fn requirements(kind: AssetKind) -> &'static UploadRequirement {
    match kind {
        AssetKind::Main => &MAIN_REQUIREMENT,
        AssetKind::Trailer => &TRAILER_REQUIREMENT,
        AssetKind::Thumbnail => &THUMBNAIL_REQUIREMENT,
    }
}

/// Validate a selected file against the rules for its asset kind.
///
/// Checks in order: size, format, duration (only when the duration is
/// knowable client-side). Returns the first violation.
pub fn validate(file: &FileDescriptor, kind: AssetKind) -> Result<(), ValidationError> {
    let requirement = requirements(kind);

    if file.size_bytes > requirement.max_size_bytes {
        return Err(ValidationError::TooLarge {
            actual_bytes: file.size_bytes,
            limit_bytes: requirement.max_size_bytes,
        });
    }

    if !format_accepted(file, requirement) {
        return Err(ValidationError::UnacceptedFormat {
            format: describe_format(file),
            accepted: requirement.accepted_formats.join(", "),
        });
    }

    if let (Some(actual), Some(limit)) = (file.duration_seconds, requirement.max_duration_seconds) {
        if actual > limit {
            return Err(ValidationError::TooLong {
                actual_seconds: actual,
                limit_seconds: limit,
            });
        }
    }

    Ok(())
}

/// A file matches when either its MIME type or its extension is in the
/// accepted set.
fn format_accepted(file: &FileDescriptor, requirement: &UploadRequirement) -> bool {
    let content_type = file.content_type.to_lowercase();
    if requirement.accepted_formats.contains(&content_type.as_str()) {
        return true;
    }

    match file_extension(&file.file_name) {
        Some(ext) => requirement.accepted_formats.contains(&ext.as_str()),
        None => false,
    }
}

fn file_extension(file_name: &str) -> Option<String> {
    file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

fn describe_format(file: &FileDescriptor) -> String {
    if !file.content_type.is_empty() {
        file.content_type.clone()
    } else {
        file_extension(&file.file_name).unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn descriptor(name: &str, content_type: &str, size: u64, duration: Option<u32>) -> FileDescriptor {
        FileDescriptor {
            path: PathBuf::from(name),
            file_name: name.to_string(),
            content_type: content_type.to_string(),
            size_bytes: size,
            duration_seconds: duration,
        }
    }

    #[test]
    fn accepts_a_valid_main_video() {
        let file = descriptor("feature.mp4", "video/mp4", 50 * MIB, Some(600));
        assert_eq!(validate(&file, AssetKind::Main), Ok(()));
    }

    #[test]
    fn rejects_oversize_file_with_size_violation() {
        let file = descriptor("feature.mp4", "video/mp4", GIB + 200 * MIB, Some(600));
        assert_eq!(
            validate(&file, AssetKind::Main),
            Err(ValidationError::TooLarge {
                actual_bytes: GIB + 200 * MIB,
                limit_bytes: GIB,
            })
        );
    }

    #[test]
    fn size_violation_is_reported_before_format_violation() {
        // Violates every rule; size is checked first.
        let file = descriptor("feature.avi", "video/x-msvideo", 2 * GIB, Some(3600));
        assert!(matches!(
            validate(&file, AssetKind::Main),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn rejects_unaccepted_format() {
        let file = descriptor("feature.avi", "video/x-msvideo", 50 * MIB, Some(600));
        assert!(matches!(
            validate(&file, AssetKind::Main),
            Err(ValidationError::UnacceptedFormat { .. })
        ));
    }

    #[test]
    fn accepts_format_by_extension_when_mime_is_generic() {
        let file = descriptor("feature.MOV", "application/octet-stream", 50 * MIB, None);
        assert_eq!(validate(&file, AssetKind::Main), Ok(()));
    }

    #[test]
    fn rejects_overlong_video() {
        let file = descriptor("feature.mp4", "video/mp4", 50 * MIB, Some(901));
        assert_eq!(
            validate(&file, AssetKind::Main),
            Err(ValidationError::TooLong {
                actual_seconds: 901,
                limit_seconds: 900,
            })
        );
    }

    #[test]
    fn duration_is_not_checked_when_unknown() {
        let file = descriptor("feature.mp4", "video/mp4", 50 * MIB, None);
        assert_eq!(validate(&file, AssetKind::Main), Ok(()));
    }

    #[test]
    fn thumbnails_have_no_duration_limit() {
        let file = descriptor("cover.png", "image/png", MIB, Some(999_999));
        assert_eq!(validate(&file, AssetKind::Thumbnail), Ok(()));
    }
}
