use std::sync::Arc;

use crate::cache::CacheEngine;

#[derive(Clone)]
pub struct AdminState {
    pub engine: Arc<CacheEngine>,
}
