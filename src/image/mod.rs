//! Image materialization: source fetch, deterministic tagging, and the
//! external OCI build/push pipeline. Grounded on
//! `dispatch_build_and_push.py`'s `OCIImageBuilder`.

mod builder;
mod registry;
mod source;
mod tag;

pub use builder::{ensure_default_registry_secret, ensure_user_registry_secret, ImageBuilder, PREDEFINED_STACKS_DIR};
pub use registry::user_registry_secret_name;
pub use tag::compute_image_tag;
