//! Identity commands.
//!
//! Every command follows the same cycle through [`CommandExecutor`]: build a
//! fresh write model, validate against it, compute the events and append
//! them with the model's sequence as the expected sequence. Commands that
//! would not change anything append nothing.

use crate::events::{
    Gender, HumanAdded, HumanOtpAdded, IamEvent, LockoutPolicyAdded, LockoutPolicyRemoved, OrgAdded, OrgRemoved,
    PolicyScope, UserRemoved,
};
use crate::write_model::{HumanWriteModel, LockoutPolicyWriteModel, OrgWriteModel, ProfileChange};
use eventide_core::crypto::{CryptoValue, EncryptionCodec};
use eventide_core::event::PendingEvent;
use eventide_core::write_model::WriteModel;
use eventide_runtime::command::{CommandError, CommandExecutor, Executed};
use std::sync::Arc;

/// Who runs a command, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    /// Instance (tenant) the command runs in.
    pub instance_id: String,
    /// Organization that owns created resources.
    pub org_id: String,
    /// Principal running the command.
    pub actor_id: String,
}

impl CommandContext {
    /// Create a context.
    #[must_use]
    pub fn new(instance_id: impl Into<String>, org_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            org_id: org_id.into(),
            actor_id: actor_id.into(),
        }
    }
}

/// A human user to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddHuman {
    /// Login name.
    pub user_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Nickname.
    pub nick_name: String,
    /// Display name; defaults to "first last".
    pub display_name: Option<String>,
    /// Language tag.
    pub preferred_language: String,
    /// Gender.
    pub gender: Gender,
    /// Email address.
    pub email: String,
}

impl AddHuman {
    fn validate(&self) -> Result<(), CommandError> {
        let missing = [
            ("user name", &self.user_name),
            ("first name", &self.first_name),
            ("last name", &self.last_name),
            ("email", &self.email),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty());
        if let Some((field, _)) = missing {
            return Err(CommandError::Rejected(format!("{field} is required")));
        }
        if !self.email.contains('@') {
            return Err(CommandError::Rejected(format!("invalid email: {}", self.email)));
        }
        Ok(())
    }

    fn event(&self) -> HumanAdded {
        HumanAdded {
            user_name: self.user_name.trim().to_string(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            nick_name: self.nick_name.clone(),
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| format!("{} {}", self.first_name, self.last_name)),
            preferred_language: self.preferred_language.clone(),
            gender: self.gender,
            email: self.email.clone(),
        }
    }
}

/// Lockout policy settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutPolicy {
    /// Failed password checks before lockout; 0 disables lockout.
    pub max_password_attempts: u64,
    /// Whether users see how many attempts are left.
    pub show_lockout_failures: bool,
}

/// Handlers for every identity command.
#[derive(Clone)]
pub struct IdentityCommands {
    executor: CommandExecutor<IamEvent>,
    codec: Arc<dyn EncryptionCodec>,
}

impl IdentityCommands {
    /// Create the handlers. `codec` encrypts OTP secrets.
    #[must_use]
    pub fn new(executor: CommandExecutor<IamEvent>, codec: Arc<dyn EncryptionCodec>) -> Self {
        Self { executor, codec }
    }

    /// Create a human user.
    ///
    /// # Errors
    ///
    /// [`CommandError::Rejected`] for missing or invalid fields,
    /// [`CommandError::AlreadyExists`] if the user ID was used before.
    pub async fn add_human(
        &self,
        ctx: &CommandContext,
        user_id: &str,
        human: &AddHuman,
    ) -> Result<Executed<HumanWriteModel>, CommandError> {
        human.validate()?;
        let event = human.event();
        self.executor
            .execute(
                || HumanWriteModel::new(&ctx.instance_id, user_id),
                |model| {
                    if model.state().exists() {
                        return Err(CommandError::AlreadyExists(format!("user {user_id}")));
                    }
                    Ok(Some(vec![PendingEvent::from_event(&event, &ctx.org_id, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Change profile fields. Appends nothing when every given value equals
    /// the current one.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the user does not exist or was removed.
    pub async fn change_profile(
        &self,
        ctx: &CommandContext,
        user_id: &str,
        change: &ProfileChange,
    ) -> Result<Executed<HumanWriteModel>, CommandError> {
        self.executor
            .execute(
                || HumanWriteModel::new(&ctx.instance_id, user_id),
                |model| {
                    let owner = active_user(model, user_id)?;
                    let Some(changed) = model.profile_changed(change.clone()) else {
                        return Ok(None);
                    };
                    Ok(Some(vec![PendingEvent::from_event(&changed, owner, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Register a TOTP secret. The secret is stored encrypted.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the user is not active,
    /// [`CommandError::AlreadyExists`] if a secret is registered,
    /// [`CommandError::Crypto`] if encryption fails.
    pub async fn add_otp(
        &self,
        ctx: &CommandContext,
        user_id: &str,
        secret: &str,
    ) -> Result<Executed<HumanWriteModel>, CommandError> {
        if secret.is_empty() {
            return Err(CommandError::Rejected("otp secret is empty".to_string()));
        }
        let secret = CryptoValue::encrypt(self.codec.as_ref(), secret.as_bytes())?;
        self.executor
            .execute(
                || HumanWriteModel::new(&ctx.instance_id, user_id),
                |model| {
                    let owner = active_user(model, user_id)?;
                    if model.otp_added {
                        return Err(CommandError::AlreadyExists(format!("otp of user {user_id}")));
                    }
                    let event = HumanOtpAdded { secret: secret.clone() };
                    Ok(Some(vec![PendingEvent::from_event(&event, owner, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Remove a user.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the user is not active.
    pub async fn remove_user(&self, ctx: &CommandContext, user_id: &str) -> Result<Executed<HumanWriteModel>, CommandError> {
        self.executor
            .execute(
                || HumanWriteModel::new(&ctx.instance_id, user_id),
                |model| {
                    let owner = active_user(model, user_id)?;
                    let event = UserRemoved {
                        user_name: model.user_name.clone(),
                    };
                    Ok(Some(vec![PendingEvent::from_event(&event, owner, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Create an organization.
    ///
    /// # Errors
    ///
    /// [`CommandError::Rejected`] for an empty name,
    /// [`CommandError::AlreadyExists`] if the ID was used before.
    pub async fn add_org(&self, ctx: &CommandContext, org_id: &str, name: &str) -> Result<Executed<OrgWriteModel>, CommandError> {
        if name.trim().is_empty() {
            return Err(CommandError::Rejected("organization name is required".to_string()));
        }
        self.executor
            .execute(
                || OrgWriteModel::new(&ctx.instance_id, org_id),
                |model| {
                    if model.state().exists() {
                        return Err(CommandError::AlreadyExists(format!("organization {org_id}")));
                    }
                    let event = OrgAdded { name: name.trim().to_string() };
                    Ok(Some(vec![PendingEvent::from_event(&event, org_id, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Remove an organization.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the organization is not active.
    pub async fn remove_org(&self, ctx: &CommandContext, org_id: &str) -> Result<Executed<OrgWriteModel>, CommandError> {
        self.executor
            .execute(
                || OrgWriteModel::new(&ctx.instance_id, org_id),
                |model| {
                    if !model.is_active() {
                        return Err(CommandError::NotFound(format!("organization {org_id}")));
                    }
                    let event = OrgRemoved { name: model.name.clone() };
                    Ok(Some(vec![PendingEvent::from_event(&event, org_id, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Give an organization its own lockout policy.
    ///
    /// # Errors
    ///
    /// [`CommandError::AlreadyExists`] if the organization has one,
    /// [`CommandError::NotFound`] if the organization was removed.
    pub async fn add_org_lockout_policy(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        policy: LockoutPolicy,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.add_lockout_policy(ctx, PolicyScope::Org, org_id, policy).await
    }

    /// Change an organization's lockout policy; no-op when nothing differs.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the organization has no policy.
    pub async fn change_org_lockout_policy(
        &self,
        ctx: &CommandContext,
        org_id: &str,
        max_password_attempts: Option<u64>,
        show_lockout_failures: Option<bool>,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.change_lockout_policy(ctx, PolicyScope::Org, org_id, max_password_attempts, show_lockout_failures)
            .await
    }

    /// Drop an organization's policy so the instance default applies again.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if the organization has no policy.
    pub async fn remove_org_lockout_policy(
        &self,
        ctx: &CommandContext,
        org_id: &str,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.executor
            .execute(
                || LockoutPolicyWriteModel::new(PolicyScope::Org, &ctx.instance_id, org_id),
                |model| {
                    if !model.active {
                        return Err(CommandError::NotFound(format!("lockout policy of {org_id}")));
                    }
                    Ok(Some(vec![PendingEvent::from_event(&LockoutPolicyRemoved, org_id, &ctx.actor_id)?]))
                },
            )
            .await
    }

    /// Set the instance's default lockout policy.
    ///
    /// # Errors
    ///
    /// [`CommandError::AlreadyExists`] if the default is already set.
    pub async fn add_default_lockout_policy(
        &self,
        ctx: &CommandContext,
        policy: LockoutPolicy,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.add_lockout_policy(ctx, PolicyScope::Instance, &ctx.instance_id, policy)
            .await
    }

    /// Change the instance's default lockout policy; no-op when nothing
    /// differs.
    ///
    /// # Errors
    ///
    /// [`CommandError::NotFound`] if no default is set.
    pub async fn change_default_lockout_policy(
        &self,
        ctx: &CommandContext,
        max_password_attempts: Option<u64>,
        show_lockout_failures: Option<bool>,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.change_lockout_policy(
            ctx,
            PolicyScope::Instance,
            &ctx.instance_id,
            max_password_attempts,
            show_lockout_failures,
        )
        .await
    }

    async fn add_lockout_policy(
        &self,
        ctx: &CommandContext,
        scope: PolicyScope,
        owner_id: &str,
        policy: LockoutPolicy,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        let added = LockoutPolicyAdded {
            max_password_attempts: policy.max_password_attempts,
            show_lockout_failures: policy.show_lockout_failures,
        };
        self.executor
            .execute(
                || LockoutPolicyWriteModel::new(scope, &ctx.instance_id, owner_id),
                |model| {
                    if model.owner_removed {
                        return Err(CommandError::NotFound(format!("organization {owner_id}")));
                    }
                    if model.active {
                        return Err(CommandError::AlreadyExists(format!("lockout policy of {owner_id}")));
                    }
                    Ok(Some(vec![added.pending(scope, owner_id, &ctx.actor_id)?]))
                },
            )
            .await
    }

    async fn change_lockout_policy(
        &self,
        ctx: &CommandContext,
        scope: PolicyScope,
        owner_id: &str,
        max_password_attempts: Option<u64>,
        show_lockout_failures: Option<bool>,
    ) -> Result<Executed<LockoutPolicyWriteModel>, CommandError> {
        self.executor
            .execute(
                || LockoutPolicyWriteModel::new(scope, &ctx.instance_id, owner_id),
                |model| {
                    if !model.active {
                        return Err(CommandError::NotFound(format!("lockout policy of {owner_id}")));
                    }
                    let Some(changed) = model.changed(max_password_attempts, show_lockout_failures) else {
                        return Ok(None);
                    };
                    Ok(Some(vec![changed.pending(scope, owner_id, &ctx.actor_id)?]))
                },
            )
            .await
    }
}

/// Resource owner of an active user.
fn active_user<'a>(model: &'a HumanWriteModel, user_id: &str) -> Result<&'a str, CommandError> {
    if !model.is_active() {
        return Err(CommandError::NotFound(format!("user {user_id}")));
    }
    Ok(model.state().resource_owner.as_deref().unwrap_or_default())
}
