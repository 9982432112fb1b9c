//! Property-based tests for the domain invariants that must hold for any
//! input shape: consent activity, bulk intake conservation, idempotency
//! scoping and canonical hashing.

use proptest::collection::vec;
use proptest::prelude::*;

use chrono::{Duration as ChronoDuration, Utc};

use fapigate_core::{
    Amount, ConsentId, CustomerId, FileId, Iban, IdempotencyKey, ParticipantId, RequestHash,
    ScopeSet,
};
use fapigate_engine::bulk::{items_digest, BulkFile, BulkFileStatus, BulkItemSubmission, BulkSubmission, IntegrityMode};
use fapigate_engine::consent::{Consent, ConsentStatus};
use fapigate_engine::idempotency::scope_key;

const GOOD_IBANS: [&str; 3] = [
    "GB82WEST12345698765432",
    "DE89370400440532013000",
    "FR1420041010050500013M02606",
];
const BAD_IBAN: &str = "GB82WEST12345698765431";

fn consent(expires_at: chrono::DateTime<Utc>) -> Consent {
    Consent::create(
        ConsentId::generate(),
        ParticipantId::new("tpp-001").unwrap(),
        CustomerId::new("psu-77").unwrap(),
        ScopeSet::from_raw(["payments"]),
        "payment initiation",
        expires_at,
        None,
    )
    .unwrap()
    .0
}

proptest! {
    /// Expiry is a half-open window: alive strictly before, lapsed at and
    /// after the boundary.
    #[test]
    fn prop_consent_expiry_boundary(life_secs in 2i64..86_400, delta_secs in -86_400i64..86_400) {
        let expires_at = Utc::now() + ChronoDuration::seconds(life_secs);
        let consent = consent(expires_at);

        let probe = expires_at + ChronoDuration::seconds(delta_secs);
        prop_assert_eq!(consent.is_expired_at(probe), delta_secs >= 0);
    }

    /// Activity is exactly Authorized-and-unexpired, whatever path the
    /// consent took to its current status.
    #[test]
    fn prop_consent_activity_matches_status(authorize in any::<bool>(), revoke in any::<bool>()) {
        let mut consent = consent(Utc::now() + ChronoDuration::hours(1));

        if authorize {
            consent.authorize().unwrap();
        }
        if revoke {
            consent.revoke("property probe").unwrap();
        }

        let expected_status = match (authorize, revoke) {
            (_, true) => ConsentStatus::Revoked,
            (true, false) => ConsentStatus::Authorized,
            (false, false) => ConsentStatus::Pending,
        };
        prop_assert_eq!(consent.status, expected_status);
        prop_assert_eq!(consent.is_active(), authorize && !revoke);
    }

    /// Intake conserves items: every item is either accepted or rejected,
    /// the accepted amounts sum exactly, and the precomputed settlement
    /// status follows the counts.
    #[test]
    fn prop_bulk_intake_conserves_items(
        items in vec((any::<bool>(), 0i64..50_000, 0usize..3), 1..60)
    ) {
        let submissions: Vec<_> = items
            .iter()
            .enumerate()
            .map(|(i, (good, amount, pick))| BulkItemSubmission {
                end_to_end_id: format!("e2e-{i}"),
                creditor_iban: if *good { GOOD_IBANS[*pick] } else { BAD_IBAN }.to_string(),
                amount: Amount::from_minor_units(*amount),
            })
            .collect();
        let submission = BulkSubmission {
            consent: ConsentId::generate(),
            items: submissions,
            integrity: IntegrityMode::None,
        };

        let file = BulkFile::intake(
            FileId::generate(),
            ParticipantId::new("tpp-001").unwrap(),
            IdempotencyKey::new("file-prop").unwrap(),
            RequestHash::of_value(&serde_json::json!({"probe": true})),
            &submission,
            100,
        )
        .unwrap();

        let total = items.len() as u32;
        prop_assert_eq!(file.total_items, total);
        prop_assert_eq!(file.accepted_items + file.rejected_items, total);
        prop_assert_eq!(file.status, BulkFileStatus::Processing);

        let expected_sum: i64 = items
            .iter()
            .filter(|(good, amount, _)| *good && *amount > 0)
            .map(|(_, amount, _)| *amount)
            .sum();
        prop_assert_eq!(file.total_amount, Amount::from_minor_units(expected_sum));

        let expected_target = if file.rejected_items == 0 {
            BulkFileStatus::Completed
        } else if file.accepted_items == 0 {
            BulkFileStatus::Rejected
        } else {
            BulkFileStatus::PartiallyAccepted
        };
        prop_assert_eq!(file.target_status, expected_target);
        prop_assert_eq!(file.report(Utc::now()).items.len(), items.len());
    }

    /// Distinct (participant, key) pairs never fold to one storage scope.
    #[test]
    fn prop_idempotency_scopes_are_injective(
        p1 in "[a-z0-9-]{1,16}", k1 in "[A-Za-z0-9._~-]{1,40}",
        p2 in "[a-z0-9-]{1,16}", k2 in "[A-Za-z0-9._~-]{1,40}",
    ) {
        let scope_a = scope_key(
            &ParticipantId::new(&p1).unwrap(),
            &IdempotencyKey::new(&k1).unwrap(),
        );
        let scope_b = scope_key(
            &ParticipantId::new(&p2).unwrap(),
            &IdempotencyKey::new(&k2).unwrap(),
        );
        prop_assert_eq!(scope_a == scope_b, p1 == p2 && k1 == k2);
    }

    /// A declared digest stays valid for the same items and breaks for any
    /// amount change.
    #[test]
    fn prop_items_digest_tracks_content(
        amounts in vec(1i64..50_000, 1..20),
        mutate_at in any::<prop::sample::Index>(),
    ) {
        let items: Vec<_> = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| BulkItemSubmission {
                end_to_end_id: format!("e2e-{i}"),
                creditor_iban: GOOD_IBANS[i % GOOD_IBANS.len()].to_string(),
                amount: Amount::from_minor_units(*amount),
            })
            .collect();

        let digest = items_digest(&items).unwrap();
        prop_assert_eq!(&digest, &items_digest(&items.clone()).unwrap());

        let mut altered = items;
        let at = mutate_at.index(altered.len());
        altered[at].amount = Amount::from_minor_units(amounts[at] + 1);
        prop_assert_ne!(&digest, &items_digest(&altered).unwrap());
    }

    /// Parsing strips spacing and case without changing identity, and the
    /// checksum catches any single-digit substitution.
    #[test]
    fn prop_iban_parsing_normalizes_and_detects_substitution(
        pick in 0usize..3,
        spaces in vec(any::<bool>(), 34),
        lowers in vec(any::<bool>(), 34),
        substitute_at in any::<prop::sample::Index>(),
    ) {
        let clean = GOOD_IBANS[pick];
        let mut decorated = String::new();
        for (i, c) in clean.chars().enumerate() {
            if spaces[i] {
                decorated.push(' ');
            }
            decorated.push(if lowers[i] { c.to_ascii_lowercase() } else { c });
        }
        let parsed = Iban::parse(&decorated).unwrap();
        prop_assert_eq!(parsed.as_str(), clean);

        // Flip one digit; mod-97 must refuse the result
        let digit_positions: Vec<usize> = clean
            .char_indices()
            .filter(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .collect();
        let at = digit_positions[substitute_at.index(digit_positions.len())];
        let mut corrupted: Vec<u8> = clean.bytes().collect();
        corrupted[at] = b'0' + (corrupted[at] - b'0' + 1) % 10;
        let corrupted = String::from_utf8(corrupted).unwrap();
        prop_assert!(Iban::parse(&corrupted).is_err());
    }
}
