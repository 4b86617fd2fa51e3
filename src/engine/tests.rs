use super::*;
use super::conflict::{now_ms, validate_span};
use crate::limits::*;
use crate::wal::Wal;
use ulid::Ulid;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms

/// Monday 2025-03-03 00:00 UTC.
const DAY: Ms = 1_740_960_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("calendard_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> (Engine, PathBuf) {
    let path = test_wal_path(name);
    let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
    (engine, path)
}

async fn book(engine: &Engine, title: &str, start: Ms, end: Ms) -> Ulid {
    let id = Ulid::new();
    engine
        .create_booking(id, BookingDraft::titled(title), Span::new(start, end))
        .await
        .unwrap();
    id
}

// ── Validation ───────────────────────────────────────────

#[test]
fn validate_span_rejects_inverted_and_empty() {
    assert!(matches!(
        validate_span(&Span { start: 2000, end: 1000 }),
        Err(EngineError::InvalidSpan(_))
    ));
    assert!(matches!(
        validate_span(&Span { start: 1000, end: 1000 }),
        Err(EngineError::InvalidSpan(_))
    ));
    assert!(validate_span(&Span::new(DAY, DAY + H)).is_ok());
}

#[test]
fn validate_span_limits() {
    assert!(matches!(
        validate_span(&Span::new(-10, 10)),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_span(&Span::new(DAY, DAY + MAX_SPAN_DURATION_MS + 1)),
        Err(EngineError::LimitExceeded("span too wide"))
    ));
    assert!(validate_span(&Span::new(DAY, DAY + MAX_SPAN_DURATION_MS)).is_ok());
}

#[test]
fn now_is_after_2020() {
    assert!(now_ms() > 1_577_836_800_000);
}

// ── Clients ──────────────────────────────────────────────

#[tokio::test]
async fn engine_create_and_list_clients() {
    let (engine, _) = new_engine("clients_list.wal");
    let zed = Ulid::new();
    let acme = Ulid::new();
    engine.create_client(zed, "Zed Ltd".into(), None).await.unwrap();
    engine
        .create_client(acme, "Acme".into(), Some("ops@acme.test".into()))
        .await
        .unwrap();

    let clients = engine.list_clients().await;
    assert_eq!(clients.len(), 2);
    assert_eq!(clients[0].name, "Acme");
    assert_eq!(clients[0].email.as_deref(), Some("ops@acme.test"));
    assert_eq!(clients[1].id, zed);
}

#[tokio::test]
async fn engine_duplicate_client_rejected() {
    let (engine, _) = new_engine("clients_dup.wal");
    let id = Ulid::new();
    engine.create_client(id, "Acme".into(), None).await.unwrap();
    let result = engine.create_client(id, "Acme again".into(), None).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(x)) if x == id));
}

#[tokio::test]
async fn engine_client_name_too_long() {
    let (engine, _) = new_engine("clients_long.wal");
    let result = engine
        .create_client(Ulid::new(), "x".repeat(MAX_NAME_LEN + 1), None)
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn engine_delete_client_keeps_bookings_unassigned() {
    let (engine, _) = new_engine("clients_delete.wal");
    let client = Ulid::new();
    engine
        .create_client(client, "Acme".into(), Some("ops@acme.test".into()))
        .await
        .unwrap();

    let id = Ulid::new();
    let draft = BookingDraft {
        client_id: Some(client),
        ..BookingDraft::titled("Onboarding")
    };
    engine
        .create_booking(id, draft, Span::new(DAY + 9 * H, DAY + 10 * H))
        .await
        .unwrap();
    let info = engine.get_booking(id).await.unwrap();
    assert_eq!(info.client_name.as_deref(), Some("Acme"));
    assert_eq!(info.client_email.as_deref(), Some("ops@acme.test"));

    engine.delete_client(client).await.unwrap();
    let info = engine.get_booking(id).await.unwrap();
    assert_eq!(info.client_id, None);
    assert_eq!(info.client_name, None);
    assert_eq!(info.client_email, None);
    assert!(engine.list_clients().await.is_empty());
}

#[tokio::test]
async fn engine_delete_missing_client() {
    let (engine, _) = new_engine("clients_delete_missing.wal");
    let id = Ulid::new();
    assert!(matches!(engine.delete_client(id).await, Err(EngineError::NotFound(x)) if x == id));
}

// ── Booking creation ─────────────────────────────────────

#[tokio::test]
async fn engine_create_booking_is_confirmed() {
    let (engine, _) = new_engine("create.wal");
    let id = book(&engine, "Kickoff", DAY + 9 * H, DAY + 10 * H).await;

    let info = engine.get_booking(id).await.unwrap();
    assert_eq!(info.title, "Kickoff");
    assert_eq!(info.status, BookingStatus::Confirmed);
    assert_eq!(info.duration_minutes(), 60);
    assert!(info.created_at > 0);
    assert_eq!(info.updated_at, None);
}

#[tokio::test]
async fn engine_overlapping_booking_conflicts() {
    let (engine, _) = new_engine("conflict.wal");
    let first = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;

    let result = engine
        .create_booking(
            Ulid::new(),
            BookingDraft::titled("B"),
            Span::new(DAY + 9 * H + 30 * M, DAY + 11 * H),
        )
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == first));
    assert_eq!(engine.booking_count().await, 1);
}

#[tokio::test]
async fn engine_adjacent_bookings_allowed() {
    let (engine, _) = new_engine("adjacent.wal");
    book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    book(&engine, "B", DAY + 10 * H, DAY + 11 * H).await;
    book(&engine, "C", DAY + 8 * H, DAY + 9 * H).await;
    assert_eq!(engine.booking_count().await, 3);
}

#[tokio::test]
async fn engine_inverted_span_rejected() {
    let (engine, _) = new_engine("inverted.wal");
    let result = engine
        .create_booking(
            Ulid::new(),
            BookingDraft::titled("Backwards"),
            Span { start: DAY + 10 * H, end: DAY + 9 * H },
        )
        .await;
    assert!(matches!(result, Err(EngineError::InvalidSpan(_))));
}

#[tokio::test]
async fn engine_booking_unknown_client_rejected() {
    let (engine, _) = new_engine("unknown_client.wal");
    let ghost = Ulid::new();
    let draft = BookingDraft {
        client_id: Some(ghost),
        ..BookingDraft::titled("Ghost meeting")
    };
    let result = engine
        .create_booking(Ulid::new(), draft, Span::new(DAY, DAY + H))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == ghost));
}

#[tokio::test]
async fn engine_duplicate_booking_id_rejected() {
    let (engine, _) = new_engine("dup_booking.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    let result = engine
        .create_booking(id, BookingDraft::titled("A again"), Span::new(DAY + 2 * H, DAY + 3 * H))
        .await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn engine_cancelled_booking_frees_slot() {
    let (engine, _) = new_engine("cancel_frees.wal");
    let first = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    engine.cancel_booking(first).await.unwrap();

    let second = book(&engine, "B", DAY + 9 * H, DAY + 10 * H).await;
    assert_eq!(engine.booking_count().await, 2);
    assert_eq!(
        engine.get_booking(second).await.unwrap().status,
        BookingStatus::Confirmed
    );
}

// ── Batch ────────────────────────────────────────────────

#[tokio::test]
async fn engine_batch_create() {
    let (engine, _) = new_engine("batch.wal");
    let batch: Vec<_> = (0..5)
        .map(|i| {
            (
                Ulid::new(),
                BookingDraft::titled(format!("Slot {i}")),
                Span::new(DAY + i * H, DAY + (i + 1) * H),
            )
        })
        .collect();
    engine.batch_create_bookings(batch).await.unwrap();
    assert_eq!(engine.booking_count().await, 5);
}

#[tokio::test]
async fn engine_batch_is_one_wal_write_and_replays() {
    let (engine, path) = new_engine("batch_replay.wal");
    let ids: Vec<Ulid> = (0..4).map(|_| Ulid::new()).collect();
    let batch: Vec<_> = ids
        .iter()
        .zip(0..)
        .map(|(id, i)| {
            let span = Span::new(DAY + i * H, DAY + (i + 1) * H);
            (*id, BookingDraft::titled(format!("Slot {i}")), span)
        })
        .collect();
    engine.batch_create_bookings(batch).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 4);
    drop(engine);

    let replayed = Wal::replay(&path).unwrap();
    assert_eq!(replayed.len(), 4);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(engine.get_booking(*id).await.unwrap().title, format!("Slot {i}"));
    }
}

#[tokio::test]
async fn engine_batch_intra_conflict_commits_nothing() {
    let (engine, _) = new_engine("batch_intra.wal");
    let a = Ulid::new();
    let b = Ulid::new();
    let batch = vec![
        (a, BookingDraft::titled("A"), Span::new(DAY, DAY + H)),
        (Ulid::new(), BookingDraft::titled("Free"), Span::new(DAY + 5 * H, DAY + 6 * H)),
        (b, BookingDraft::titled("B"), Span::new(DAY + 30 * M, DAY + 2 * H)),
    ];
    let result = engine.batch_create_bookings(batch).await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == a));
    assert_eq!(engine.booking_count().await, 0);
}

#[tokio::test]
async fn engine_batch_conflict_with_existing_commits_nothing() {
    let (engine, _) = new_engine("batch_existing.wal");
    let existing = book(&engine, "Existing", DAY + 3 * H, DAY + 4 * H).await;
    let batch = vec![
        (Ulid::new(), BookingDraft::titled("A"), Span::new(DAY, DAY + H)),
        (Ulid::new(), BookingDraft::titled("B"), Span::new(DAY + 3 * H, DAY + 5 * H)),
    ];
    let result = engine.batch_create_bookings(batch).await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == existing));
    assert_eq!(engine.booking_count().await, 1);
}

#[tokio::test]
async fn engine_batch_duplicate_ids_rejected() {
    let (engine, _) = new_engine("batch_dup.wal");
    let id = Ulid::new();
    let batch = vec![
        (id, BookingDraft::titled("A"), Span::new(DAY, DAY + H)),
        (id, BookingDraft::titled("B"), Span::new(DAY + 2 * H, DAY + 3 * H)),
    ];
    assert!(matches!(
        engine.batch_create_bookings(batch).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert_eq!(engine.booking_count().await, 0);
}

#[tokio::test]
async fn engine_batch_too_large() {
    let (engine, _) = new_engine("batch_large.wal");
    let batch: Vec<_> = (0..=MAX_BATCH_SIZE as i64)
        .map(|i| (Ulid::new(), BookingDraft::titled("x"), Span::new(DAY + i * H, DAY + i * H + M)))
        .collect();
    assert!(matches!(
        engine.batch_create_bookings(batch).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── Update / reschedule / lifecycle ──────────────────────

#[tokio::test]
async fn engine_update_booking_fields() {
    let (engine, _) = new_engine("update.wal");
    let client = Ulid::new();
    engine.create_client(client, "Acme".into(), None).await.unwrap();
    let id = book(&engine, "Draft title", DAY + 9 * H, DAY + 10 * H).await;

    let draft = BookingDraft {
        client_id: Some(client),
        title: "Quarterly review".into(),
        description: Some("Numbers and plans".into()),
        location: Some("Room 4".into()),
        meeting_url: None,
        notes: Some("Bring last quarter's numbers".into()),
    };
    engine
        .update_booking(id, draft, Span::new(DAY + 9 * H, DAY + 11 * H), Some(BookingStatus::Pending))
        .await
        .unwrap();

    let info = engine.get_booking(id).await.unwrap();
    assert_eq!(info.title, "Quarterly review");
    assert_eq!(info.client_name.as_deref(), Some("Acme"));
    assert_eq!(info.location.as_deref(), Some("Room 4"));
    assert_eq!(info.notes.as_deref(), Some("Bring last quarter's numbers"));
    assert_eq!(info.end, DAY + 11 * H);
    assert_eq!(info.status, BookingStatus::Pending);
    assert!(info.updated_at.is_some());
}

#[tokio::test]
async fn engine_update_keeps_status_when_omitted() {
    let (engine, _) = new_engine("update_status.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    engine
        .update_booking(id, BookingDraft::titled("A2"), Span::new(DAY, DAY + H), None)
        .await
        .unwrap();
    assert_eq!(engine.get_booking(id).await.unwrap().status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn engine_update_excludes_itself_from_conflicts() {
    let (engine, _) = new_engine("update_self.wal");
    let id = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    let other = book(&engine, "B", DAY + 11 * H, DAY + 12 * H).await;

    // Growing within its own slot is fine.
    engine
        .update_booking(id, BookingDraft::titled("A"), Span::new(DAY + 8 * H, DAY + 10 * H + 30 * M), None)
        .await
        .unwrap();

    // Growing into B is not.
    let result = engine
        .update_booking(id, BookingDraft::titled("A"), Span::new(DAY + 9 * H, DAY + 11 * H + M), None)
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == other));
}

#[tokio::test]
async fn engine_update_missing_booking() {
    let (engine, _) = new_engine("update_missing.wal");
    let id = Ulid::new();
    let result = engine
        .update_booking(id, BookingDraft::titled("x"), Span::new(DAY, DAY + H), None)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(x)) if x == id));
}

#[tokio::test]
async fn engine_reschedule_keeps_order() {
    let (engine, _) = new_engine("reschedule.wal");
    let early = book(&engine, "Early", DAY + 8 * H, DAY + 9 * H).await;
    let late = book(&engine, "Late", DAY + 12 * H, DAY + 13 * H).await;

    engine
        .reschedule_booking(early, Span::new(DAY + 14 * H, DAY + 15 * H))
        .await
        .unwrap();

    let listed = engine.list_bookings(&BookingFilter::default()).await;
    let ids: Vec<Ulid> = listed.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![late, early]);
    assert_eq!(listed[1].start, DAY + 14 * H);
    assert!(listed[1].updated_at.is_some());
}

#[tokio::test]
async fn engine_reschedule_within_own_slot() {
    let (engine, _) = new_engine("reschedule_self.wal");
    let id = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    engine
        .reschedule_booking(id, Span::new(DAY + 9 * H + 15 * M, DAY + 10 * H + 15 * M))
        .await
        .unwrap();
}

#[tokio::test]
async fn engine_reschedule_into_conflict() {
    let (engine, _) = new_engine("reschedule_conflict.wal");
    let a = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    let b = book(&engine, "B", DAY + 11 * H, DAY + 12 * H).await;
    let result = engine
        .reschedule_booking(a, Span::new(DAY + 11 * H + 30 * M, DAY + 12 * H + 30 * M))
        .await;
    assert!(matches!(result, Err(EngineError::Conflict(x)) if x == b));
}

#[tokio::test]
async fn engine_reschedule_cancelled_rejected() {
    let (engine, _) = new_engine("reschedule_cancelled.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    engine.cancel_booking(id).await.unwrap();
    let result = engine.reschedule_booking(id, Span::new(DAY + 2 * H, DAY + 3 * H)).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidState { status: BookingStatus::Cancelled, action: "reschedule", .. })
    ));
}

#[tokio::test]
async fn engine_cancel_completed_rejected() {
    let (engine, _) = new_engine("cancel_completed.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    engine.complete_booking(id).await.unwrap();
    assert_eq!(engine.get_booking(id).await.unwrap().status, BookingStatus::Completed);

    let result = engine.cancel_booking(id).await;
    assert!(matches!(result, Err(EngineError::InvalidState { action: "cancel", .. })));
}

#[tokio::test]
async fn engine_complete_cancelled_rejected() {
    let (engine, _) = new_engine("complete_cancelled.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    engine.cancel_booking(id).await.unwrap();
    let result = engine.complete_booking(id).await;
    assert!(matches!(result, Err(EngineError::InvalidState { action: "complete", .. })));
}

#[tokio::test]
async fn engine_delete_booking() {
    let (engine, _) = new_engine("delete.wal");
    let id = book(&engine, "A", DAY, DAY + H).await;
    engine.delete_booking(id).await.unwrap();
    assert!(matches!(engine.get_booking(id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_booking(id).await, Err(EngineError::NotFound(_))));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn engine_list_bookings_filters() {
    let (engine, _) = new_engine("list_filters.wal");
    let client = Ulid::new();
    engine.create_client(client, "Acme".into(), None).await.unwrap();

    let a = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    let b = Ulid::new();
    engine
        .create_booking(
            b,
            BookingDraft { client_id: Some(client), ..BookingDraft::titled("B") },
            Span::new(DAY + 11 * H, DAY + 12 * H),
        )
        .await
        .unwrap();
    let c = book(&engine, "C", DAY + 24 * H, DAY + 25 * H).await;
    engine.cancel_booking(c).await.unwrap();

    let all = engine.list_bookings(&BookingFilter::default()).await;
    assert_eq!(all.iter().map(|x| x.id).collect::<Vec<_>>(), vec![a, b, c]);

    let same_day = BookingFilter {
        start_from: Some(DAY),
        end_until: Some(DAY + 24 * H),
        ..Default::default()
    };
    assert_eq!(engine.list_bookings(&same_day).await.len(), 2);

    let by_client = BookingFilter { client_id: Some(client), ..Default::default() };
    let listed = engine.list_bookings(&by_client).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, b);

    let cancelled = BookingFilter { status: Some(BookingStatus::Cancelled), ..Default::default() };
    let listed = engine.list_bookings(&cancelled).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, c);
}

#[tokio::test]
async fn engine_upcoming_confirmed_only() {
    let (engine, _) = new_engine("upcoming.wal");
    let past = book(&engine, "Past", DAY, DAY + H).await;
    let next = book(&engine, "Next", DAY + 2 * H, DAY + 3 * H).await;
    let cancelled = book(&engine, "Cancelled", DAY + 4 * H, DAY + 5 * H).await;
    engine.cancel_booking(cancelled).await.unwrap();
    let later = book(&engine, "Later", DAY + 6 * H, DAY + 7 * H).await;
    let _latest = book(&engine, "Latest", DAY + 8 * H, DAY + 9 * H).await;

    let now = DAY + 30 * M;
    let upcoming = engine.upcoming_bookings(now, 2).await;
    let ids: Vec<Ulid> = upcoming.iter().map(|b| b.id).collect();
    assert_eq!(ids, vec![next, later]);
    assert!(!ids.contains(&past));

    // A booking starting exactly at `now` is not upcoming.
    let at_now = engine.upcoming_bookings(DAY + 2 * H, 10).await;
    assert!(at_now.iter().all(|b| b.id != next));
}

#[tokio::test]
async fn engine_upcoming_count_capped() {
    let (engine, _) = new_engine("upcoming_cap.wal");
    let batch: Vec<_> = (0..(MAX_UPCOMING_COUNT as i64 + 10))
        .map(|i| (Ulid::new(), BookingDraft::titled("x"), Span::new(DAY + i * H, DAY + i * H + M)))
        .collect();
    engine.batch_create_bookings(batch).await.unwrap();
    assert_eq!(
        engine.upcoming_bookings(DAY - 1, usize::MAX).await.len(),
        MAX_UPCOMING_COUNT
    );
}

#[tokio::test]
async fn engine_is_available() {
    let (engine, _) = new_engine("available.wal");
    let id = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;

    assert!(!engine.is_available(Span::new(DAY + 9 * H + 30 * M, DAY + 11 * H), None).await.unwrap());
    assert!(engine.is_available(Span::new(DAY + 10 * H, DAY + 11 * H), None).await.unwrap());
    assert!(engine.is_available(Span::new(DAY + 9 * H, DAY + 10 * H), Some(id)).await.unwrap());

    engine.cancel_booking(id).await.unwrap();
    assert!(engine.is_available(Span::new(DAY + 9 * H, DAY + 10 * H), None).await.unwrap());

    assert!(matches!(
        engine.is_available(Span { start: DAY + H, end: DAY }, None).await,
        Err(EngineError::InvalidSpan(_))
    ));
}

#[tokio::test]
async fn engine_overlapping_bookings_in_range() {
    let (engine, _) = new_engine("overlapping.wal");
    let a = book(&engine, "A", DAY + 9 * H, DAY + 10 * H).await;
    engine.cancel_booking(a).await.unwrap();
    // Slot is free again, so B can take an overlapping time.
    let b = book(&engine, "B", DAY + 9 * H + 30 * M, DAY + 10 * H + 30 * M).await;
    let _lone = book(&engine, "Lone", DAY + 14 * H, DAY + 15 * H).await;

    let overlapping = engine.overlapping_bookings(&BookingFilter::default()).await;
    let mut ids: Vec<Ulid> = overlapping.iter().map(|x| x.id).collect();
    ids.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(ids, expected);

    // Filtering out cancelled bookings leaves nothing overlapping.
    let confirmed = BookingFilter { status: Some(BookingStatus::Confirmed), ..Default::default() };
    assert!(engine.overlapping_bookings(&confirmed).await.is_empty());
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn engine_replays_wal_after_restart() {
    let path = test_wal_path("replay.wal");
    let client = Ulid::new();
    let (kept, moved, cancelled, deleted);
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_client(client, "Acme".into(), None).await.unwrap();
        kept = Ulid::new();
        engine
            .create_booking(
                kept,
                BookingDraft { client_id: Some(client), ..BookingDraft::titled("Kept") },
                Span::new(DAY, DAY + H),
            )
            .await
            .unwrap();
        moved = book(&engine, "Moved", DAY + 2 * H, DAY + 3 * H).await;
        engine
            .reschedule_booking(moved, Span::new(DAY + 5 * H, DAY + 6 * H))
            .await
            .unwrap();
        cancelled = book(&engine, "Cancelled", DAY + 7 * H, DAY + 8 * H).await;
        engine.cancel_booking(cancelled).await.unwrap();
        deleted = book(&engine, "Deleted", DAY + 9 * H, DAY + 10 * H).await;
        engine.delete_booking(deleted).await.unwrap();
    }

    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(engine.booking_count().await, 3);
    assert_eq!(engine.get_booking(kept).await.unwrap().client_name.as_deref(), Some("Acme"));
    assert_eq!(engine.get_booking(moved).await.unwrap().start, DAY + 5 * H);
    assert_eq!(engine.get_booking(cancelled).await.unwrap().status, BookingStatus::Cancelled);
    assert!(engine.get_booking(deleted).await.is_err());
}

#[tokio::test]
async fn engine_compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let client = Ulid::new();
    let id;
    {
        let engine = Engine::new(path.clone(), Arc::new(NotifyHub::new())).unwrap();
        engine.create_client(client, "Acme".into(), None).await.unwrap();
        id = book(&engine, "Survivor", DAY, DAY + H).await;
        engine.complete_booking(id).await.unwrap();
        for i in 0..20 {
            let churn = book(&engine, "Churn", DAY + (i + 2) * H, DAY + (i + 3) * H).await;
            engine.delete_booking(churn).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 43);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }

    assert_eq!(Wal::replay(&path).unwrap().len(), 2);
    let engine = Engine::new(path, Arc::new(NotifyHub::new())).unwrap();
    let info = engine.get_booking(id).await.unwrap();
    assert_eq!(info.status, BookingStatus::Completed);
    assert_eq!(engine.list_clients().await.len(), 1);
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn engine_mutations_notify_listeners() {
    let (engine, _) = new_engine("notify.wal");
    let mut calendar = engine.notify.subscribe(crate::notify::CALENDAR_CHANNEL);

    let id = book(&engine, "A", DAY, DAY + H).await;
    let mut entity = engine
        .notify
        .subscribe(&format!("booking_{}", id.to_string().to_lowercase()));
    engine.cancel_booking(id).await.unwrap();

    assert_eq!(calendar.recv().await.unwrap().kind(), "booking_created");
    assert_eq!(calendar.recv().await.unwrap().kind(), "booking_status_changed");
    let event = entity.recv().await.unwrap();
    assert_eq!(event.entity_id(), id);
    assert_eq!(event.kind(), "booking_status_changed");
}

#[tokio::test]
async fn engine_failed_mutation_does_not_notify() {
    let (engine, _) = new_engine("notify_failed.wal");
    book(&engine, "A", DAY, DAY + H).await;
    let mut rx = engine.notify.subscribe(crate::notify::CALENDAR_CHANNEL);

    let result = engine
        .create_booking(Ulid::new(), BookingDraft::titled("B"), Span::new(DAY, DAY + H))
        .await;
    assert!(result.is_err());
    assert!(rx.try_recv().is_err());
}
