use std::time::Duration;

use crate::model::ActorId;
use crate::telemetry::generate_correlation_id;

/// Who is calling and under what bounds; supplied by the hosting request layer
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub actor: ActorId,
    pub actor_name: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub correlation_id: String,
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
    /// Administrators may delete other authors' comments
    pub is_admin: bool,
}

impl RequestContext {
    pub fn new(actor: ActorId) -> Self {
        Self {
            actor,
            actor_name: None,
            ip_address: None,
            user_agent: None,
            correlation_id: generate_correlation_id(),
            timeout: None,
            is_admin: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.actor_name = Some(name.into());
        self
    }

    pub fn with_client(mut self, ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        self.ip_address = Some(ip_address.into());
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.is_admin = true;
        self
    }
}
