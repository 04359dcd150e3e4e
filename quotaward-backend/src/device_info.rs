use std::borrow::Cow;

use regex::Regex;

/// Matches the free-memory token clients put right before the trailing core count,
/// e.g. `Xiaomi_M2012K11AC_7853MB_8`.
pub const DEFAULT_VOLATILE_PATTERN: &str = r"(^|_)\d+MB_(\d+)$";

/// Canonicalises device-info telemetry so fluctuating fields don't defeat exact matching.
///
/// The same normaliser must be used when building the ban set and when checking it.
pub trait DeviceInfoNormalizer: Send + Sync + 'static {
    fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str>;
}

/// Strips a volatile token matched by a regex.
///
/// The pattern's first and second capture groups are kept, everything else the
/// match covers is dropped.
#[derive(Debug, Clone)]
pub struct VolatileTokenNormalizer {
    pattern: Regex,
}

impl VolatileTokenNormalizer {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }
}

impl DeviceInfoNormalizer for VolatileTokenNormalizer {
    fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        self.pattern.replace(raw, "${1}${2}")
    }
}

/// Leaves device info untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityNormalizer;

impl DeviceInfoNormalizer for IdentityNormalizer {
    fn normalize<'a>(&self, raw: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(raw)
    }
}
