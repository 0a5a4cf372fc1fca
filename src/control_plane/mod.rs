//! Typed façade over the control plane's REST API.
//!
//! Everything the control plane itself does (job bookkeeping,
//! credential storage, log/bucket storage) is out of scope here — this
//! module only names the RPCs and carries the bearer tokens, the way
//! the spec's §6 table describes them.

mod client;
mod webhook;

pub use client::ControlPlaneClient;
pub use webhook::WebhookClient;
