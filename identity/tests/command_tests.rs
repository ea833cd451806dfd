//! Identity commands against the in-memory event store.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::panic)] // Test assertions

use eventide_core::event_store::EventStore;
use eventide_core::eventstore::Eventstore;
use eventide_core::registry::EventTypeRegistry;
use eventide_core::write_model::WriteModel;
use eventide_identity::events::{Gender, IamEvent, registry, types};
use eventide_identity::{AddHuman, CommandContext, IdentityCommands, LockoutPolicy, ProfileChange};
use eventide_runtime::command::{CommandError, CommandExecutor, Outcome};
use eventide_testing::{InMemoryEventStore, XorCodec};
use std::sync::Arc;

struct Fixture {
    store: Arc<InMemoryEventStore>,
    registry: Arc<EventTypeRegistry<IamEvent>>,
    codec: XorCodec,
    commands: IdentityCommands,
}

impl Fixture {
    fn new() -> Self {
        let store = Arc::new(InMemoryEventStore::new());
        let registry = Arc::new(registry().unwrap());
        let codec = XorCodec::new("otp-key", 0x2f);
        let eventstore = Eventstore::new(Arc::clone(&store) as Arc<dyn EventStore>, Arc::clone(&registry));
        let commands = IdentityCommands::new(CommandExecutor::new(eventstore), Arc::new(codec.clone()));
        Self {
            store,
            registry,
            codec,
            commands,
        }
    }

    fn decoded(&self, event_type: &str) -> Vec<IamEvent> {
        self.store
            .events()
            .iter()
            .filter(|e| e.meta.event_type.as_str() == event_type)
            .map(|e| self.registry.decode(e).unwrap().data)
            .collect()
    }
}

fn ctx() -> CommandContext {
    CommandContext::new("inst", "org-1", "admin")
}

fn ada() -> AddHuman {
    AddHuman {
        user_name: "ada".into(),
        first_name: "Ada".into(),
        last_name: "Lovelace".into(),
        preferred_language: "en".into(),
        gender: Gender::Female,
        email: "ada@example.com".into(),
        ..AddHuman::default()
    }
}

const POLICY: LockoutPolicy = LockoutPolicy {
    max_password_attempts: 5,
    show_lockout_failures: true,
};

#[tokio::test]
async fn added_human_is_owned_by_the_context_org() {
    let fx = Fixture::new();

    let executed = fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();

    let events = executed.outcome.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].meta.resource_owner, "org-1");
    assert_eq!(events[0].meta.actor_id, "admin");
    assert_eq!(executed.model.display_name, "Ada Lovelace");
    assert!(executed.model.is_active());
}

#[tokio::test]
async fn human_ids_are_not_reused() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();
    fx.commands.remove_user(&ctx(), "u1").await.unwrap();

    let err = fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap_err();

    assert!(matches!(err, CommandError::AlreadyExists(_)));
    assert_eq!(fx.store.len(), 2);
}

#[tokio::test]
async fn invalid_humans_are_rejected_before_loading() {
    let fx = Fixture::new();

    let missing = AddHuman {
        last_name: "  ".into(),
        ..ada()
    };
    let err = fx.commands.add_human(&ctx(), "u1", &missing).await.unwrap_err();
    assert!(matches!(err, CommandError::Rejected(msg) if msg.contains("last name")));

    let bad_email = AddHuman {
        email: "ada.example.com".into(),
        ..ada()
    };
    let err = fx.commands.add_human(&ctx(), "u1", &bad_email).await.unwrap_err();
    assert!(matches!(err, CommandError::Rejected(_)));
    assert!(fx.store.is_empty());
}

#[tokio::test]
async fn unchanged_profile_appends_nothing() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();

    let same = ProfileChange {
        first_name: Some("Ada".into()),
        preferred_language: Some("en".into()),
        gender: Some(Gender::Unspecified),
        ..ProfileChange::default()
    };
    let executed = fx.commands.change_profile(&ctx(), "u1", &same).await.unwrap();

    assert_eq!(executed.outcome, Outcome::Unchanged);
    assert_eq!(fx.store.len(), 1);
}

#[tokio::test]
async fn profile_change_carries_only_the_differing_fields() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();

    let change = ProfileChange {
        first_name: Some("Augusta Ada".into()),
        last_name: Some("Lovelace".into()),
        nick_name: Some("ada".into()),
        ..ProfileChange::default()
    };
    let executed = fx.commands.change_profile(&ctx(), "u1", &change).await.unwrap();

    assert!(executed.outcome.is_committed());
    assert_eq!(executed.model.first_name, "Augusta Ada");
    assert_eq!(executed.model.state().processed_sequence.value(), 2);

    let IamEvent::HumanProfileChanged(changed) = &fx.decoded(types::HUMAN_PROFILE_CHANGED)[0] else {
        panic!("expected a profile change");
    };
    assert_eq!(changed.first_name.as_deref(), Some("Augusta Ada"));
    assert_eq!(changed.nick_name.as_deref(), Some("ada"));
    assert_eq!(changed.last_name, None);
    assert_eq!(changed.display_name, None);
}

#[tokio::test]
async fn removed_users_cannot_be_changed() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();
    fx.commands.remove_user(&ctx(), "u1").await.unwrap();

    let change = ProfileChange {
        nick_name: Some("countess".into()),
        ..ProfileChange::default()
    };
    let err = fx.commands.change_profile(&ctx(), "u1", &change).await.unwrap_err();
    assert!(matches!(err, CommandError::NotFound(_)));

    let err = fx.commands.remove_user(&ctx(), "u1").await.unwrap_err();
    assert!(matches!(err, CommandError::NotFound(_)));

    let err = fx.commands.remove_user(&ctx(), "nobody").await.unwrap_err();
    assert!(matches!(err, CommandError::NotFound(_)));
}

#[tokio::test]
async fn otp_secret_is_stored_encrypted() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();
    let secret = "JBSWY3DPEHPK3PXP";

    fx.commands.add_otp(&ctx(), "u1", secret).await.unwrap();

    let raw = fx
        .store
        .events()
        .into_iter()
        .find(|e| e.meta.event_type.as_str() == types::HUMAN_OTP_ADDED)
        .unwrap();
    assert!(!raw.payload.windows(secret.len()).any(|w| w == secret.as_bytes()));

    let IamEvent::HumanOtpAdded(otp) = &fx.decoded(types::HUMAN_OTP_ADDED)[0] else {
        panic!("expected an otp event");
    };
    assert_eq!(otp.secret.key_id, "otp-key");
    assert_eq!(otp.secret.decrypt_string(&fx.codec).unwrap(), secret);
}

#[tokio::test]
async fn second_otp_secret_is_refused() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();
    fx.commands.add_otp(&ctx(), "u1", "first").await.unwrap();

    let err = fx.commands.add_otp(&ctx(), "u1", "second").await.unwrap_err();
    assert!(matches!(err, CommandError::AlreadyExists(_)));

    let err = fx.commands.add_otp(&ctx(), "u1", "").await.unwrap_err();
    assert!(matches!(err, CommandError::Rejected(_)));
}

#[tokio::test]
async fn org_lockout_policy_lifecycle() {
    let fx = Fixture::new();
    fx.commands.add_org(&ctx(), "org-1", "Acme").await.unwrap();

    let added = fx.commands.add_org_lockout_policy(&ctx(), "org-1", POLICY).await.unwrap();
    assert!(added.model.active);
    assert_eq!(added.outcome.events()[0].meta.event_type.as_str(), types::ORG_LOCKOUT_POLICY_ADDED);

    let err = fx.commands.add_org_lockout_policy(&ctx(), "org-1", POLICY).await.unwrap_err();
    assert!(matches!(err, CommandError::AlreadyExists(_)));

    let unchanged = fx
        .commands
        .change_org_lockout_policy(&ctx(), "org-1", Some(5), Some(true))
        .await
        .unwrap();
    assert_eq!(unchanged.outcome, Outcome::Unchanged);

    let changed = fx
        .commands
        .change_org_lockout_policy(&ctx(), "org-1", Some(3), Some(true))
        .await
        .unwrap();
    assert_eq!(changed.model.max_password_attempts, 3);
    let IamEvent::LockoutPolicyChanged(change) = &fx.decoded(types::ORG_LOCKOUT_POLICY_CHANGED)[0] else {
        panic!("expected a policy change");
    };
    assert_eq!(change.max_password_attempts, Some(3));
    assert_eq!(change.show_lockout_failures, None);

    let removed = fx.commands.remove_org_lockout_policy(&ctx(), "org-1").await.unwrap();
    assert!(!removed.model.active);

    let err = fx
        .commands
        .change_org_lockout_policy(&ctx(), "org-1", Some(1), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::NotFound(_)));

    // A removed policy can be defined again.
    fx.commands.add_org_lockout_policy(&ctx(), "org-1", POLICY).await.unwrap();
}

#[tokio::test]
async fn removed_org_cannot_get_a_policy() {
    let fx = Fixture::new();
    fx.commands.add_org(&ctx(), "org-1", "Acme").await.unwrap();
    fx.commands.remove_org(&ctx(), "org-1").await.unwrap();

    let err = fx.commands.add_org_lockout_policy(&ctx(), "org-1", POLICY).await.unwrap_err();

    assert!(matches!(err, CommandError::NotFound(_)));
    assert!(fx.decoded(types::ORG_LOCKOUT_POLICY_ADDED).is_empty());
}

#[tokio::test]
async fn default_policy_is_owned_by_the_instance() {
    let fx = Fixture::new();

    let added = fx.commands.add_default_lockout_policy(&ctx(), POLICY).await.unwrap();
    let event = &added.outcome.events()[0];
    assert_eq!(event.meta.event_type.as_str(), types::INSTANCE_LOCKOUT_POLICY_ADDED);
    assert_eq!(event.meta.key.aggregate_id, "inst");
    assert_eq!(event.meta.resource_owner, "inst");

    let changed = fx
        .commands
        .change_default_lockout_policy(&ctx(), None, Some(false))
        .await
        .unwrap();
    assert!(!changed.model.show_lockout_failures);
    assert_eq!(changed.model.max_password_attempts, 5);
}

#[tokio::test]
async fn org_commands_stay_within_their_instance() {
    let fx = Fixture::new();
    fx.commands.add_org(&ctx(), "org-1", "Acme").await.unwrap();

    let other = CommandContext::new("other-inst", "org-1", "admin");
    fx.commands.add_org(&other, "org-1", "Acme Elsewhere").await.unwrap();

    let err = fx.commands.add_org(&ctx(), "org-1", "Acme").await.unwrap_err();
    assert!(matches!(err, CommandError::AlreadyExists(_)));
    assert_eq!(fx.store.len(), 2);
}

#[tokio::test]
async fn concurrent_profile_changes_are_retried_on_conflict() {
    let fx = Fixture::new();
    fx.commands.add_human(&ctx(), "u1", &ada()).await.unwrap();

    let nick = ProfileChange {
        nick_name: Some("countess".into()),
        ..ProfileChange::default()
    };
    let language = ProfileChange {
        preferred_language: Some("fr".into()),
        ..ProfileChange::default()
    };
    let ctx = ctx();
    let (a, b) = tokio::join!(
        fx.commands.change_profile(&ctx, "u1", &nick),
        fx.commands.change_profile(&ctx, "u1", &language)
    );
    a.unwrap();
    b.unwrap();

    let model = fx
        .commands
        .change_profile(&ctx, "u1", &ProfileChange::default())
        .await
        .unwrap()
        .model;
    assert_eq!(model.nick_name, "countess");
    assert_eq!(model.preferred_language, "fr");
    assert_eq!(model.state().processed_sequence.value(), 3);
}
