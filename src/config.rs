//! Composer policy configuration.
//!
//! The size and rotation thresholds of the layer classifier and the cursor
//! cap are empirically tuned for the display controller of the target
//! hardware, so they are carried here as policy parameters rather than
//! constants. Defaults match the values shipped on SAMA5 platforms.
//!
//! Every knob can be overridden through `SAMHWC_*` environment variables,
//! taking the place of the system properties a host platform would
//! traditionally provide (`ro.hwc.ovl_num` and friends).

use std::env;

use crate::utils::Size;

/// Policy parameters of the composer.
#[derive(Debug, Clone)]
pub struct HwcConfig {
    /// Minimum source-crop extent for any plane candidate
    pub min_source: Size,
    /// Minimum destination-frame extent (unrotated)
    pub min_frame: Size,
    /// Minimum destination-frame extent when a 90°/270° transform is
    /// requested (narrow axis / long axis)
    pub min_rotated_frame: Size,
    /// Maximum edge length of a layer eligible for the hardware cursor
    pub cursor_max: i32,
    /// Cap on the number of RGBA overlay windows to drive
    pub max_overlay_windows: usize,
    /// Cap on the number of video overlay windows to drive
    pub max_video_windows: usize,
    /// Preferred connector for the primary display (KMS variant), by name
    pub primary_connector: Option<String>,
    /// Connector for the external display (KMS variant); `None` disables it
    pub external_connector: Option<String>,
    /// Whether the video overlay accepts non-identity transforms
    pub allow_video_transform: bool,
    /// How long to wait on a layer's acquire fence before committing anyway,
    /// in milliseconds
    pub acquire_timeout_ms: u32,
}

impl Default for HwcConfig {
    fn default() -> Self {
        HwcConfig {
            min_source: Size::new(16, 8),
            min_frame: Size::new(8, 4),
            min_rotated_frame: Size::new(4, 8),
            cursor_max: 64,
            max_overlay_windows: 2,
            max_video_windows: 1,
            primary_connector: None,
            external_connector: None,
            allow_video_transform: false,
            acquire_timeout_ms: 1000,
        }
    }
}

impl HwcConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = HwcConfig::default();

        if let Some(n) = env::var("SAMHWC_OVL_NUM").ok().and_then(|v| v.parse().ok()) {
            config.max_overlay_windows = n;
        }
        if let Some(n) = env::var("SAMHWC_HEO_NUM").ok().and_then(|v| v.parse().ok()) {
            config.max_video_windows = n;
        }
        if let Ok(name) = env::var("SAMHWC_CONN_PRIMARY") {
            config.primary_connector = normalize_connector(&name);
        }
        if let Ok(name) = env::var("SAMHWC_CONN_EXTERNAL") {
            config.external_connector = normalize_connector(&name);
        }
        if let Ok(v) = env::var("SAMHWC_VIDEO_TRANSFORM") {
            config.allow_video_transform = parse_bool(&v);
        }

        config
    }

    /// The destination-frame minimum applying to the given transform.
    pub fn frame_minimum(&self, rotated: bool) -> Size {
        if rotated {
            self.min_rotated_frame
        } else {
            self.min_frame
        }
    }
}

fn parse_bool(v: &str) -> bool {
    v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("y")
}

/// Empty or `OFF` disables the connector, anything else is a connector name.
fn normalize_connector(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("off") {
        None
    } else {
        Some(name.to_string())
    }
}
