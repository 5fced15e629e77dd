//! MIME types served by the streamer

/// File extension used for a stream of `mime` in logs and dumps
pub fn extension(mime: &str) -> &'static str {
    match base(mime) {
        "application/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/x-flac" => "flac",
        "audio/x-wav" => "wav",
        "multipart/x-mixed-replace" => "multipart",
        "video/mpegts" => "ts",
        "video/x-dv" => "dv",
        "video/x-flv" => "flv",
        "video/x-matroska" => "mkv",
        "video/x-ms-asf" => "asf",
        "video/x-msvideo" => "avi",
        "video/webm" => "webm",
        _ => "data",
    }
}

/// Value of the `Content-Type` header for `mime`
///
/// Multipart streams need a boundary the pipeline agrees on.
pub fn content_type(mime: &str) -> String {
    if base(mime) == "multipart/x-mixed-replace" && !mime.contains("boundary=") {
        format!("{};boundary=ThisRandomString", mime)
    } else {
        mime.to_string()
    }
}

/// Live ASF needs `Pragma: features=broadcast`
pub fn needs_broadcast_pragma(mime: &str) -> bool {
    matches!(base(mime), "video/x-ms-asf" | "audio/x-ms-asf")
}

fn base(mime: &str) -> &str {
    mime.split(';').next().unwrap_or(mime).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extensions() {
        assert_eq!(extension("application/ogg"), "ogg");
        assert_eq!(extension("video/webm"), "webm");
        assert_eq!(extension("video/x-matroska"), "mkv");
        assert_eq!(extension("multipart/x-mixed-replace;boundary=x"), "multipart");
        assert_eq!(extension("text/plain"), "data");
    }

    #[test]
    fn test_multipart_gets_boundary() {
        assert_eq!(
            content_type("multipart/x-mixed-replace"),
            "multipart/x-mixed-replace;boundary=ThisRandomString"
        );
        assert_eq!(content_type("video/webm"), "video/webm");
    }

    #[test]
    fn test_asf_pragma() {
        assert!(needs_broadcast_pragma("video/x-ms-asf"));
        assert!(needs_broadcast_pragma("audio/x-ms-asf"));
        assert!(!needs_broadcast_pragma("application/ogg"));
    }
}
