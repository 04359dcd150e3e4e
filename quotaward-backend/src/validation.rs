/// Input validation functions for all backend routes
use thiserror::Error;

/// Longest device identifier accepted from a client.
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Largest bonus grantable in one request (one day).
pub const MAX_BONUS_SECONDS: i64 = 24 * 60 * 60;

/// Most devices accepted by one bulk request.
pub const MAX_DEVICES: usize = 1000;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    DeviceIdEmpty,

    #[error("Device ID too long (max {MAX_DEVICE_ID_LEN} characters, got {0})")]
    DeviceIdTooLong(usize),

    #[error("Device ID contains control characters")]
    DeviceIdInvalidChars,

    #[error("Bonus seconds must be positive (got {0})")]
    SecondsNotPositive(i64),

    #[error("Bonus seconds too large (max {MAX_BONUS_SECONDS}, got {0})")]
    SecondsTooLarge(i64),

    #[error("Device list cannot be empty")]
    DeviceListEmpty,

    #[error("Device list too large (max {max} devices, got {actual})")]
    DeviceListTooLarge { max: usize, actual: usize },
}

/// Validates a client device identifier
///
/// Rules:
/// - Cannot be empty
/// - Max 128 characters
/// - No control characters
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::DeviceIdEmpty);
    }

    let len = device_id.chars().count();
    if len > MAX_DEVICE_ID_LEN {
        return Err(ValidationError::DeviceIdTooLong(len));
    }

    if device_id.chars().any(char::is_control) {
        return Err(ValidationError::DeviceIdInvalidChars);
    }

    Ok(())
}

/// Validates a bonus grant amount
pub fn validate_bonus_seconds(seconds: i64) -> Result<(), ValidationError> {
    if seconds <= 0 {
        return Err(ValidationError::SecondsNotPositive(seconds));
    }

    if seconds > MAX_BONUS_SECONDS {
        return Err(ValidationError::SecondsTooLarge(seconds));
    }

    Ok(())
}

/// Validates a list of device identifiers for bulk operations
///
/// Rules:
/// - At least one device, at most 1000
/// - Each device ID must be valid
pub fn validate_device_list(device_ids: &[String]) -> Result<(), ValidationError> {
    if device_ids.is_empty() {
        return Err(ValidationError::DeviceListEmpty);
    }

    if device_ids.len() > MAX_DEVICES {
        return Err(ValidationError::DeviceListTooLarge {
            max: MAX_DEVICES,
            actual: device_ids.len(),
        });
    }

    for device_id in device_ids {
        validate_device_id(device_id)?;
    }

    Ok(())
}
