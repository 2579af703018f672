pub mod auth;
pub mod handler;

use crate::governor::Governor;
use std::sync::Arc;

pub struct ApiState {
    pub governor: Arc<Governor>,
    pub default_model: String,
}
