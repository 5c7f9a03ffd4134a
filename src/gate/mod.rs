//! Enforcement gate for pushes leaving a sandbox

pub mod approval;
pub mod git;
pub mod notify;
pub mod protocol;
pub mod push;

pub use approval::{
    cancel, ApprovalError, ApprovalRequest, ApprovalStatus, ApprovalStore, FileApprovalStore,
};
pub use git::{GitCli, GitTransport};
pub use notify::{Notifier, WebhookNotifier, DEFAULT_WEBHOOK_TIMEOUT};
pub use protocol::{HelperCommand, ProtocolError, PushReply, Refspec};
pub use push::PushGate;
