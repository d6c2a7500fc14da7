//! Watch page rendering
//!
//! A deliberately thin HTML preview around the direct stream URL. The page
//! only needs a player element pointing at the file endpoint; richer
//! templating is a presentation concern outside the streaming core.

use crate::http::path::build_stream_path;
use crate::MessageId;

/// Render the `/watch` preview page for a file.
///
/// `message_id` and `hash` have already passed the URL grammar, so they are
/// safe to interpolate verbatim.
pub fn watch_page(message_id: MessageId, hash: &str) -> String {
    let stream_path = build_stream_path(message_id, hash);
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>streamgate</title>
<style>
  body {{ margin: 0; background: #111; color: #eee; font-family: sans-serif; display: flex; flex-direction: column; align-items: center; }}
  video {{ max-width: 100vw; max-height: 85vh; margin-top: 2rem; }}
  a {{ color: #6af; margin: 1rem; }}
</style>
</head>
<body>
<video controls preload="metadata" src="{stream_path}"></video>
<a href="{stream_path}" download>Download</a>
</body>
</html>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_page_embeds_stream_url() {
        let page = watch_page(188, "abcdef");
        assert!(page.contains("src=\"/abcdef188\""));
        assert!(page.contains("<video"));
    }
}
