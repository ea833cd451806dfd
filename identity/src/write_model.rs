//! Write models of the identity domain.

use crate::events::{
    Gender, HumanProfileChanged, IamEvent, LockoutPolicyChanged, ORG, PolicyScope, USER, types,
};
use eventide_core::event::RecordedEvent;
use eventide_core::search::{SearchQuery, SubQuery};
use eventide_core::stream::AggregateKey;
use eventide_core::write_model::{Diff, WriteModel, WriteModelState};

/// Proposed profile values; `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileChange {
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Nickname.
    pub nick_name: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Language tag.
    pub preferred_language: Option<String>,
    /// Gender; [`Gender::Unspecified`] counts as not given.
    pub gender: Option<Gender>,
}

/// A human user as far as commands are concerned.
#[derive(Debug, Clone)]
pub struct HumanWriteModel {
    state: WriteModelState,
    /// Login name.
    pub user_name: String,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Nickname.
    pub nick_name: String,
    /// Display name.
    pub display_name: String,
    /// Language tag.
    pub preferred_language: String,
    /// Gender.
    pub gender: Gender,
    /// Whether an OTP secret is registered.
    pub otp_added: bool,
    /// Whether the user was removed.
    pub removed: bool,
}

impl HumanWriteModel {
    /// Empty model for one user.
    #[must_use]
    pub fn new(instance_id: &str, user_id: &str) -> Self {
        Self {
            state: WriteModelState::new(AggregateKey::new(instance_id, USER, user_id)),
            user_name: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            nick_name: String::new(),
            display_name: String::new(),
            preferred_language: String::new(),
            gender: Gender::Unspecified,
            otp_added: false,
            removed: false,
        }
    }

    /// Whether the user exists and was not removed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.exists() && !self.removed
    }

    /// The change event for `change`, or `None` if every given value equals
    /// the current one.
    #[must_use]
    pub fn profile_changed(&self, change: ProfileChange) -> Option<HumanProfileChanged> {
        let gender = change.gender.filter(|g| g.is_specified());
        Diff::new(HumanProfileChanged::default())
            .field(&self.first_name, change.first_name, |c, v| c.first_name = Some(v))
            .field(&self.last_name, change.last_name, |c, v| c.last_name = Some(v))
            .field(&self.nick_name, change.nick_name, |c, v| c.nick_name = Some(v))
            .field(&self.display_name, change.display_name, |c, v| c.display_name = Some(v))
            .field(&self.preferred_language, change.preferred_language, |c, v| {
                c.preferred_language = Some(v);
            })
            .field(&self.gender, gender, |c, v| c.gender = Some(v))
            .into_change()
    }
}

impl WriteModel for HumanWriteModel {
    type Event = IamEvent;

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn query(&self) -> SearchQuery {
        SearchQuery::for_aggregate(&self.state.key)
    }

    fn apply(&mut self, event: &RecordedEvent<IamEvent>) {
        match &event.data {
            IamEvent::HumanAdded(e) => {
                self.user_name.clone_from(&e.user_name);
                self.first_name.clone_from(&e.first_name);
                self.last_name.clone_from(&e.last_name);
                self.nick_name.clone_from(&e.nick_name);
                self.display_name.clone_from(&e.display_name);
                self.preferred_language.clone_from(&e.preferred_language);
                self.gender = e.gender;
                self.removed = false;
            }
            IamEvent::HumanProfileChanged(e) => {
                if let Some(v) = &e.first_name {
                    self.first_name.clone_from(v);
                }
                if let Some(v) = &e.last_name {
                    self.last_name.clone_from(v);
                }
                if let Some(v) = &e.nick_name {
                    self.nick_name.clone_from(v);
                }
                if let Some(v) = &e.display_name {
                    self.display_name.clone_from(v);
                }
                if let Some(v) = &e.preferred_language {
                    self.preferred_language.clone_from(v);
                }
                if let Some(v) = e.gender {
                    self.gender = v;
                }
            }
            IamEvent::HumanOtpAdded(_) => self.otp_added = true,
            IamEvent::UserRemoved(_) => self.removed = true,
            _ => {}
        }
    }
}

/// Whether an organization exists.
#[derive(Debug, Clone)]
pub struct OrgWriteModel {
    state: WriteModelState,
    /// Organization name.
    pub name: String,
    /// Whether the organization was removed.
    pub removed: bool,
}

impl OrgWriteModel {
    /// Empty model for one organization.
    #[must_use]
    pub fn new(instance_id: &str, org_id: &str) -> Self {
        Self {
            state: WriteModelState::new(AggregateKey::new(instance_id, ORG, org_id)),
            name: String::new(),
            removed: false,
        }
    }

    /// Whether the organization exists and was not removed.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.state.exists() && !self.removed
    }
}

impl WriteModel for OrgWriteModel {
    type Event = IamEvent;

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn query(&self) -> SearchQuery {
        let key = &self.state.key;
        SearchQuery::new().tenant(key.tenant.clone()).add_query(
            SubQuery::new()
                .aggregate_types([key.aggregate_type.clone()])
                .aggregate_ids([key.aggregate_id.clone()])
                .event_types([types::ORG_ADDED, types::ORG_REMOVED]),
        )
    }

    fn apply(&mut self, event: &RecordedEvent<IamEvent>) {
        match &event.data {
            IamEvent::OrgAdded(e) => {
                self.name.clone_from(&e.name);
                self.removed = false;
            }
            IamEvent::OrgRemoved(_) => self.removed = true,
            _ => {}
        }
    }
}

/// Lockout policy of an instance or organization.
///
/// Organization policies also track the organization's removal: a policy
/// of a removed organization is gone for good.
#[derive(Debug, Clone)]
pub struct LockoutPolicyWriteModel {
    state: WriteModelState,
    scope: PolicyScope,
    /// Whether a policy is currently defined.
    pub active: bool,
    /// Attempt limit.
    pub max_password_attempts: u64,
    /// Failure display setting.
    pub show_lockout_failures: bool,
    /// Whether the owning organization was removed.
    pub owner_removed: bool,
}

impl LockoutPolicyWriteModel {
    /// Empty model for the policy of `owner_id` (an organization ID, or the
    /// instance ID for [`PolicyScope::Instance`]).
    #[must_use]
    pub fn new(scope: PolicyScope, instance_id: &str, owner_id: &str) -> Self {
        Self {
            state: WriteModelState::new(AggregateKey::new(instance_id, scope.aggregate_type(), owner_id)),
            scope,
            active: false,
            max_password_attempts: 0,
            show_lockout_failures: false,
            owner_removed: false,
        }
    }

    /// Scope of the policy.
    #[must_use]
    pub const fn scope(&self) -> PolicyScope {
        self.scope
    }

    /// The change event, or `None` if nothing differs.
    #[must_use]
    pub fn changed(&self, max_password_attempts: Option<u64>, show_lockout_failures: Option<bool>) -> Option<LockoutPolicyChanged> {
        Diff::new(LockoutPolicyChanged::default())
            .field(&self.max_password_attempts, max_password_attempts, |c, v| {
                c.max_password_attempts = Some(v);
            })
            .field(&self.show_lockout_failures, show_lockout_failures, |c, v| {
                c.show_lockout_failures = Some(v);
            })
            .into_change()
    }
}

impl WriteModel for LockoutPolicyWriteModel {
    type Event = IamEvent;

    fn state(&self) -> &WriteModelState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut WriteModelState {
        &mut self.state
    }

    fn query(&self) -> SearchQuery {
        let key = &self.state.key;
        let mut event_types = vec![self.scope.added_type(), self.scope.changed_type()];
        if self.scope == PolicyScope::Org {
            event_types.extend([types::ORG_LOCKOUT_POLICY_REMOVED, types::ORG_REMOVED]);
        }
        SearchQuery::new().tenant(key.tenant.clone()).add_query(
            SubQuery::new()
                .aggregate_types([key.aggregate_type.clone()])
                .aggregate_ids([key.aggregate_id.clone()])
                .event_types(event_types),
        )
    }

    fn apply(&mut self, event: &RecordedEvent<IamEvent>) {
        match &event.data {
            IamEvent::LockoutPolicyAdded(e) => {
                self.active = true;
                self.max_password_attempts = e.max_password_attempts;
                self.show_lockout_failures = e.show_lockout_failures;
            }
            IamEvent::LockoutPolicyChanged(e) => {
                if let Some(v) = e.max_password_attempts {
                    self.max_password_attempts = v;
                }
                if let Some(v) = e.show_lockout_failures {
                    self.show_lockout_failures = v;
                }
            }
            IamEvent::LockoutPolicyRemoved(_) => self.active = false,
            IamEvent::OrgRemoved(_) => {
                self.active = false;
                self.owner_removed = true;
            }
            _ => {}
        }
    }
}
