use std::{ops::Deref, sync::Arc};

use kocao_core::attach::AttachService;
use kocao_core::audit::AuditStore;
use kocao_core::auth::TokenStore;

pub struct AppInner {
    pub client: kube::Client,
    pub namespace: String,
    pub tokens: Arc<TokenStore>,
    pub audit: Arc<AuditStore>,
    pub attach: Arc<AttachService>,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl Deref for App {
    type Target = AppInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl App {
    pub fn new(
        client: kube::Client,
        namespace: String,
        tokens: Arc<TokenStore>,
        audit: Arc<AuditStore>,
        attach: Arc<AttachService>,
    ) -> Self {
        Self {
            inner: Arc::new(AppInner {
                client,
                namespace,
                tokens,
                audit,
                attach,
            }),
        }
    }
}
