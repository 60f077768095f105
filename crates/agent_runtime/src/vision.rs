use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

use crate::host::ViewerHost;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// Outcome of one framebuffer capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotCapture {
    pub ok: bool,
    pub image_data_url: Option<String>,
    pub meta: Value,
    pub error: Option<String>,
}

/// Captures the current framebuffer as a PNG data URL without resizing the
/// viewport. `width` and `height` are recorded as requested dimensions only.
/// Must be called on the host context.
pub fn capture_viewer_snapshot(host: &mut dyn ViewerHost, width: u32, height: u32) -> SnapshotCapture {
    let viewport = host.viewport().ok().flatten();
    match host.capture_png() {
        Ok(bytes) => {
            let (actual_width, actual_height) = viewport
                .filter(|(w, h)| *w > 0 && *h > 0)
                .unwrap_or((width, height));
            SnapshotCapture {
                ok: true,
                image_data_url: Some(format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(&bytes))),
                meta: json!({
                    "width": actual_width,
                    "height": actual_height,
                    "bytes": bytes.len(),
                    "requested_width": width,
                    "requested_height": height,
                }),
                error: None,
            }
        }
        Err(error) => SnapshotCapture {
            ok: false,
            image_data_url: None,
            meta: json!({}),
            error: Some(error.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use agent_client::decode_data_url_image;

    use super::*;
    use crate::demo::DemoViewer;

    #[test]
    fn capture_encodes_a_png_data_url_with_viewport_meta() {
        let mut viewer = DemoViewer::new();

        let capture = capture_viewer_snapshot(&mut viewer, 1024, 0);

        assert!(capture.ok);
        let url = capture.image_data_url.expect("data url");
        let (data, mime) = decode_data_url_image(&url).expect("decodable data url");
        assert_eq!(mime, "image/png");
        assert!(!data.is_empty());
        assert_eq!(capture.meta["width"], 640);
        assert_eq!(capture.meta["height"], 480);
        assert_eq!(capture.meta["requested_width"], 1024);
        assert_eq!(capture.meta["requested_height"], 0);
    }

    #[test]
    fn capture_failure_is_reported_without_an_image() {
        let mut viewer = DemoViewer::new();
        viewer.set_capture_fails(true);

        let capture = capture_viewer_snapshot(&mut viewer, 1024, 0);

        assert!(!capture.ok);
        assert_eq!(capture.image_data_url, None);
        assert_eq!(capture.error.as_deref(), Some("framebuffer unavailable"));
    }
}
