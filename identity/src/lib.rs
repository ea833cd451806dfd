//! Identity domain on top of Eventide.
//!
//! Human users, organizations and lockout policies, written through the
//! command cycle of [`eventide_runtime::command::CommandExecutor`] and read
//! from the `lockout_policies` view kept by a projection runner.
//!
//! # Overview
//!
//! - [`events`]: payloads, event type tags and the decoder registry
//! - [`write_model`]: state rebuilt per command from an aggregate's history
//! - [`command`]: [`IdentityCommands`], one method per command
//! - [`projection`]: the lockout policy view, shared between instance
//!   defaults and organization overrides
//! - [`query`]: reads on that view
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(eventide_identity::events::registry()?);
//! let eventstore = Eventstore::new(store, registry);
//! let commands = IdentityCommands::new(CommandExecutor::new(eventstore), codec);
//!
//! let ctx = CommandContext::new("inst", "org-1", "admin");
//! commands.add_org(&ctx, "org-1", "Acme").await?;
//! commands
//!     .add_org_lockout_policy(&ctx, "org-1", LockoutPolicy { max_password_attempts: 5, show_lockout_failures: true })
//!     .await?;
//! ```

pub mod command;
pub mod events;
pub mod projection;
pub mod query;
pub mod write_model;

pub use command::{AddHuman, CommandContext, IdentityCommands, LockoutPolicy};
pub use events::{IamEvent, PolicyScope};
pub use projection::{LOCKOUT_POLICY_TABLE, lockout_policy_projection};
pub use query::{LockoutPolicyView, effective_lockout_policy};
pub use write_model::{HumanWriteModel, LockoutPolicyWriteModel, OrgWriteModel, ProfileChange};

use sqlx::PgPool;

/// Run the migrations of this crate.
///
/// Migrations of the other Eventide crates live in the same database and
/// are ignored here.
///
/// # Errors
///
/// Returns the migration error.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}
