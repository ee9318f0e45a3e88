//! Opaque identifier generation.

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

/// Generate an opaque entity id (groups, policies, webhooks, jobs).
pub fn new_key() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Short random token suffixed onto launched server names so repeated
/// launches from one template never collide.
pub fn server_name_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
