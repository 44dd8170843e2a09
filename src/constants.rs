//! Reserved token values shared by the tokenizer side and the fusion engine.

/// Placeholder id standing in for "insert one image embedding block here".
/// Negative, outside any vocabulary range.
pub const IMAGE_TOKEN_INDEX: i64 = -200;

/// Label id excluding a position from loss computation.
pub const IGNORE_INDEX: i64 = -100;

/// Marker expanded by [`crate::utils::tokenizer_image_token`].
pub const DEFAULT_IMAGE_TOKEN: &str = "<image>";

/// Key prefix routed to the text decoder in a consolidated checkpoint.
pub const LANGUAGE_MODEL_PREFIX: &str = "language_model";
/// Key prefix routed to the vision encoder in a consolidated checkpoint.
pub const VISION_TOWER_PREFIX: &str = "vision_tower";
/// Key prefix routed to the connector in a consolidated checkpoint.
pub const CONNECTOR_PREFIX: &str = "connector";
