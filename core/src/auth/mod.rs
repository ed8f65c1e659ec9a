mod middleware;
mod token_store;

pub use middleware::{authenticate, fixed_resource_id, last_path_segment, require_scopes};
pub use token_store::{format_scopes, has_scope, parse_scopes, Principal, TokenRecord, TokenStore};
