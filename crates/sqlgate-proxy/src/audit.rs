use tracing::info;
use uuid::Uuid;

/// Actor identity attached to every audit record.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub username: String,
    pub client_addr: String,
}

impl SessionContext {
    pub fn new(username: &str, client_addr: &str) -> SessionContext {
        SessionContext {
            session_id: Uuid::new_v4(),
            username: username.to_string(),
            client_addr: client_addr.to_string(),
        }
    }
}

/// Receives one record per Execute with the fully interpolated SQL.
/// Persistence lives outside this crate; implementations here only hand
/// the record off.
pub trait AuditSink: Send + Sync {
    fn record_executed_statement(&self, ctx: &SessionContext, sql: &str);
}

/// Emits audit records as structured log events under `target: "audit"`,
/// where the log pipeline picks them up.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record_executed_statement(&self, ctx: &SessionContext, sql: &str) {
        info!(
            target: "audit",
            session = %ctx.session_id,
            user = %ctx.username,
            client = %ctx.client_addr,
            sql = %sql,
        );
    }
}

/// Used when auditing is disabled in config.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record_executed_statement(&self, _ctx: &SessionContext, _sql: &str) {}
}
