//! Events of the identity domain.
//!
//! Every payload is a bincode struct. The lockout policy payloads are shared
//! by instances and organizations: the same struct is stored under
//! `instance.policy.lockout.*` and `org.policy.lockout.*`, and the aggregate
//! type tells the two apart.

use eventide_core::crypto::CryptoValue;
use eventide_core::event::{Event, EventError, PendingEvent};
use eventide_core::registry::{EventTypeRegistry, RegistryError};
use serde::{Deserialize, Serialize};

/// Aggregate type of users.
pub const USER: &str = "user";
/// Aggregate type of organizations.
pub const ORG: &str = "org";
/// Aggregate type of instances (tenants).
pub const INSTANCE: &str = "instance";

/// Event type tags.
pub mod types {
    /// A human user was created.
    pub const HUMAN_ADDED: &str = "user.human.added";
    /// Profile fields of a human changed.
    pub const HUMAN_PROFILE_CHANGED: &str = "user.human.profile.changed";
    /// A one-time-password secret was registered.
    pub const HUMAN_OTP_ADDED: &str = "user.human.otp.added";
    /// A user was removed.
    pub const USER_REMOVED: &str = "user.removed";
    /// An organization was created.
    pub const ORG_ADDED: &str = "org.added";
    /// An organization was removed.
    pub const ORG_REMOVED: &str = "org.removed";
    /// An organization got its own lockout policy.
    pub const ORG_LOCKOUT_POLICY_ADDED: &str = "org.policy.lockout.added";
    /// An organization's lockout policy changed.
    pub const ORG_LOCKOUT_POLICY_CHANGED: &str = "org.policy.lockout.changed";
    /// An organization went back to the default lockout policy.
    pub const ORG_LOCKOUT_POLICY_REMOVED: &str = "org.policy.lockout.removed";
    /// The default lockout policy of an instance was set.
    pub const INSTANCE_LOCKOUT_POLICY_ADDED: &str = "instance.policy.lockout.added";
    /// The default lockout policy of an instance changed.
    pub const INSTANCE_LOCKOUT_POLICY_CHANGED: &str = "instance.policy.lockout.changed";
    /// An instance and everything in it was removed.
    pub const INSTANCE_REMOVED: &str = "instance.removed";
}

/// Gender of a human user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    /// Not given.
    #[default]
    Unspecified,
    /// Female.
    Female,
    /// Male.
    Male,
    /// Diverse.
    Diverse,
}

impl Gender {
    /// Whether a value was actually given.
    #[must_use]
    pub const fn is_specified(self) -> bool {
        !matches!(self, Self::Unspecified)
    }
}

/// `user.human.added`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanAdded {
    /// Login name, unique per instance.
    pub user_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Nickname.
    pub nick_name: String,
    /// Name shown in user interfaces.
    pub display_name: String,
    /// BCP 47 language tag.
    pub preferred_language: String,
    /// Gender.
    pub gender: Gender,
    /// Email address.
    pub email: String,
}

impl Event for HumanAdded {
    fn event_type(&self) -> &'static str {
        types::HUMAN_ADDED
    }
}

/// `user.human.profile.changed`; unset fields did not change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanProfileChanged {
    /// New given name.
    pub first_name: Option<String>,
    /// New family name.
    pub last_name: Option<String>,
    /// New nickname.
    pub nick_name: Option<String>,
    /// New display name.
    pub display_name: Option<String>,
    /// New language tag.
    pub preferred_language: Option<String>,
    /// New gender.
    pub gender: Option<Gender>,
}

impl Event for HumanProfileChanged {
    fn event_type(&self) -> &'static str {
        types::HUMAN_PROFILE_CHANGED
    }
}

/// `user.human.otp.added`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanOtpAdded {
    /// TOTP secret, encrypted with the key-storage codec.
    pub secret: CryptoValue,
}

impl Event for HumanOtpAdded {
    fn event_type(&self) -> &'static str {
        types::HUMAN_OTP_ADDED
    }
}

/// `user.removed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRemoved {
    /// Login name that becomes free again.
    pub user_name: String,
}

impl Event for UserRemoved {
    fn event_type(&self) -> &'static str {
        types::USER_REMOVED
    }
}

/// `org.added`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgAdded {
    /// Organization name.
    pub name: String,
}

impl Event for OrgAdded {
    fn event_type(&self) -> &'static str {
        types::ORG_ADDED
    }
}

/// `org.removed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRemoved {
    /// Name of the removed organization.
    pub name: String,
}

impl Event for OrgRemoved {
    fn event_type(&self) -> &'static str {
        types::ORG_REMOVED
    }
}

/// `org.policy.lockout.removed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicyRemoved;

impl Event for LockoutPolicyRemoved {
    fn event_type(&self) -> &'static str {
        types::ORG_LOCKOUT_POLICY_REMOVED
    }
}

/// `instance.removed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRemoved {
    /// Name of the removed instance.
    pub name: String,
}

impl Event for InstanceRemoved {
    fn event_type(&self) -> &'static str {
        types::INSTANCE_REMOVED
    }
}

/// Where a lockout policy is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyScope {
    /// Default policy of an instance.
    Instance,
    /// Policy of one organization, overriding the default.
    Org,
}

impl PolicyScope {
    /// Aggregate type owning policies of this scope.
    #[must_use]
    pub const fn aggregate_type(self) -> &'static str {
        match self {
            Self::Instance => INSTANCE,
            Self::Org => ORG,
        }
    }

    /// Tag of the added event.
    #[must_use]
    pub const fn added_type(self) -> &'static str {
        match self {
            Self::Instance => types::INSTANCE_LOCKOUT_POLICY_ADDED,
            Self::Org => types::ORG_LOCKOUT_POLICY_ADDED,
        }
    }

    /// Tag of the changed event.
    #[must_use]
    pub const fn changed_type(self) -> &'static str {
        match self {
            Self::Instance => types::INSTANCE_LOCKOUT_POLICY_CHANGED,
            Self::Org => types::ORG_LOCKOUT_POLICY_CHANGED,
        }
    }

    /// Whether policies of this scope are the instance default.
    #[must_use]
    pub const fn is_default(self) -> bool {
        matches!(self, Self::Instance)
    }
}

/// `*.policy.lockout.added`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicyAdded {
    /// Failed password checks before the user is locked; 0 disables lockout.
    pub max_password_attempts: u64,
    /// Whether the login UI tells users how many attempts are left.
    pub show_lockout_failures: bool,
}

impl LockoutPolicyAdded {
    /// Encode for `scope`.
    ///
    /// # Errors
    ///
    /// [`EventError::SerializationError`] if encoding fails.
    pub fn pending(&self, scope: PolicyScope, resource_owner: &str, actor_id: &str) -> Result<PendingEvent, EventError> {
        encode(scope.added_type(), self, resource_owner, actor_id)
    }
}

/// `*.policy.lockout.changed`; unset fields did not change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicyChanged {
    /// New attempt limit.
    pub max_password_attempts: Option<u64>,
    /// New failure display setting.
    pub show_lockout_failures: Option<bool>,
}

impl LockoutPolicyChanged {
    /// Encode for `scope`.
    ///
    /// # Errors
    ///
    /// [`EventError::SerializationError`] if encoding fails.
    pub fn pending(&self, scope: PolicyScope, resource_owner: &str, actor_id: &str) -> Result<PendingEvent, EventError> {
        encode(scope.changed_type(), self, resource_owner, actor_id)
    }
}

fn encode<T: Serialize>(
    event_type: &str,
    payload: &T,
    resource_owner: &str,
    actor_id: &str,
) -> Result<PendingEvent, EventError> {
    let bytes = bincode::serialize(payload).map_err(|e| EventError::SerializationError(e.to_string()))?;
    Ok(PendingEvent::new(event_type, resource_owner, actor_id, bytes))
}

/// All events of the identity domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IamEvent {
    /// See [`HumanAdded`].
    HumanAdded(HumanAdded),
    /// See [`HumanProfileChanged`].
    HumanProfileChanged(HumanProfileChanged),
    /// See [`HumanOtpAdded`].
    HumanOtpAdded(HumanOtpAdded),
    /// See [`UserRemoved`].
    UserRemoved(UserRemoved),
    /// See [`OrgAdded`].
    OrgAdded(OrgAdded),
    /// See [`OrgRemoved`].
    OrgRemoved(OrgRemoved),
    /// Instance or org policy added; see [`LockoutPolicyAdded`].
    LockoutPolicyAdded(LockoutPolicyAdded),
    /// Instance or org policy changed; see [`LockoutPolicyChanged`].
    LockoutPolicyChanged(LockoutPolicyChanged),
    /// See [`LockoutPolicyRemoved`].
    LockoutPolicyRemoved(LockoutPolicyRemoved),
    /// See [`InstanceRemoved`].
    InstanceRemoved(InstanceRemoved),
}

/// Registry of every identity event.
///
/// # Errors
///
/// [`RegistryError`] if a tag is registered twice, which would be a bug in
/// this function.
pub fn registry() -> Result<EventTypeRegistry<IamEvent>, RegistryError> {
    Ok(EventTypeRegistry::builder()
        .register_bincode(USER, types::HUMAN_ADDED, IamEvent::HumanAdded)?
        .register_bincode(USER, types::HUMAN_PROFILE_CHANGED, IamEvent::HumanProfileChanged)?
        .register_bincode(USER, types::HUMAN_OTP_ADDED, IamEvent::HumanOtpAdded)?
        .register_bincode(USER, types::USER_REMOVED, IamEvent::UserRemoved)?
        .register_bincode(ORG, types::ORG_ADDED, IamEvent::OrgAdded)?
        .register_bincode(ORG, types::ORG_REMOVED, IamEvent::OrgRemoved)?
        .register_bincode(ORG, types::ORG_LOCKOUT_POLICY_ADDED, IamEvent::LockoutPolicyAdded)?
        .register_bincode(ORG, types::ORG_LOCKOUT_POLICY_CHANGED, IamEvent::LockoutPolicyChanged)?
        .register_bincode(ORG, types::ORG_LOCKOUT_POLICY_REMOVED, IamEvent::LockoutPolicyRemoved)?
        .register_bincode(INSTANCE, types::INSTANCE_LOCKOUT_POLICY_ADDED, IamEvent::LockoutPolicyAdded)?
        .register_bincode(INSTANCE, types::INSTANCE_LOCKOUT_POLICY_CHANGED, IamEvent::LockoutPolicyChanged)?
        .register_bincode(INSTANCE, types::INSTANCE_REMOVED, IamEvent::InstanceRemoved)?
        .build())
}
