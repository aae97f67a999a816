use super::*;
use crate::model::fixtures::{at, booking_on, intent_for};
use futures::FutureExt;
use std::time::Duration;
use ulid::Ulid;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("studiobook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn open(path: &PathBuf) -> Engine {
    Engine::new(path.clone(), EngineConfig::default()).unwrap()
}

// ── Bookings ─────────────────────────────────────────────

#[tokio::test]
async fn insert_and_get_booking() {
    let engine = open(&test_wal_path("insert_get.wal"));
    let room = Ulid::new();
    let b = booking_on(room, at(10, 0), at(12, 0));
    engine.insert_booking(b.clone()).await.unwrap();

    assert_eq!(engine.get_booking(&b.id).await, Some(b.clone()));
    assert_eq!(engine.booking_count(), 1);
    let busy = engine
        .busy_spans(&room, &Span::from_instants(at(0, 0), at(23, 0)))
        .await;
    assert_eq!(busy, vec![b.span()]);
}

#[tokio::test]
async fn overlapping_insert_rejected() {
    let engine = open(&test_wal_path("overlap.wal"));
    let room = Ulid::new();
    let first = booking_on(room, at(10, 0), at(12, 0));
    engine.insert_booking(first.clone()).await.unwrap();

    let result = engine
        .insert_booking(booking_on(room, at(11, 0), at(13, 0)))
        .await;
    match result {
        Err(EngineError::Overlap { room_id, existing }) => {
            assert_eq!(room_id, room);
            assert_eq!(existing, first.id);
        }
        other => panic!("expected overlap, got {other:?}"),
    }
    assert_eq!(engine.booking_count(), 1);
}

#[tokio::test]
async fn adjacent_and_other_room_allowed() {
    let engine = open(&test_wal_path("adjacent.wal"));
    let room = Ulid::new();
    engine
        .insert_booking(booking_on(room, at(10, 0), at(12, 0)))
        .await
        .unwrap();
    engine
        .insert_booking(booking_on(room, at(12, 0), at(13, 0)))
        .await
        .unwrap();
    engine
        .insert_booking(booking_on(Ulid::new(), at(10, 0), at(12, 0)))
        .await
        .unwrap();
    assert_eq!(engine.booking_count(), 3);
}

#[tokio::test]
async fn cancelled_booking_releases_slot() {
    let engine = open(&test_wal_path("cancel_release.wal"));
    let room = Ulid::new();
    let b = booking_on(room, at(10, 0), at(12, 0));
    engine.insert_booking(b.clone()).await.unwrap();

    let (after, changed, ()) = engine
        .modify_booking(b.id, |booking| {
            booking.status = BookingStatus::Cancelled;
            Ok::<_, EngineError>(())
        })
        .await
        .unwrap();
    assert!(changed);
    assert_eq!(after.status, BookingStatus::Cancelled);

    let window = Span::from_instants(at(0, 0), at(23, 0));
    assert!(engine.busy_spans(&room, &window).await.is_empty());
    engine
        .insert_booking(booking_on(room, at(10, 0), at(12, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn concurrent_overlapping_inserts_admit_one() {
    let engine = Arc::new(open(&test_wal_path("concurrent_overlap.wal")));
    let room = Ulid::new();

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            // All candidates overlap 10:30-11:00.
            let start = at(10, i % 30);
            eng.insert_booking(booking_on(room, start, at(11, 0))).await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::Overlap { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test]
async fn unchanged_modify_skips_wal() {
    let engine = open(&test_wal_path("unchanged_modify.wal"));
    let b = booking_on(Ulid::new(), at(10, 0), at(11, 0));
    engine.insert_booking(b.clone()).await.unwrap();
    let before = engine.wal_appends_since_compact().await;

    let (same, changed, ()) = engine
        .modify_booking(b.id, |_| Ok::<_, EngineError>(()))
        .await
        .unwrap();
    assert!(!changed);
    assert_eq!(same, b);
    assert_eq!(engine.wal_appends_since_compact().await, before);
}

#[tokio::test]
async fn failed_modify_leaves_record() {
    let engine = open(&test_wal_path("failed_modify.wal"));
    let b = booking_on(Ulid::new(), at(10, 0), at(11, 0));
    engine.insert_booking(b.clone()).await.unwrap();

    let result: Result<(Booking, bool, ()), EngineError> = engine
        .modify_booking(b.id, |booking| {
            booking.status = BookingStatus::Completed;
            Err(EngineError::LimitExceeded("nope"))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(engine.get_booking(&b.id).await.unwrap().status, BookingStatus::Pending);
}

#[tokio::test]
async fn modify_cannot_move_booking() {
    let engine = open(&test_wal_path("move_booking.wal"));
    let b = booking_on(Ulid::new(), at(10, 0), at(11, 0));
    engine.insert_booking(b.clone()).await.unwrap();

    let result = engine
        .modify_booking(b.id, |booking| {
            booking.end = at(12, 0);
            Ok::<_, EngineError>(())
        })
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn modify_unknown_booking_not_found() {
    let engine = open(&test_wal_path("modify_unknown.wal"));
    let result = engine
        .modify_booking(Ulid::new(), |_| Ok::<_, EngineError>(()))
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn inverted_span_rejected() {
    let engine = open(&test_wal_path("inverted.wal"));
    let result = engine
        .insert_booking(booking_on(Ulid::new(), at(12, 0), at(10, 0)))
        .await;
    assert!(matches!(result, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn insert_dropped_after_first_poll_still_holds_slot() {
    let path = test_wal_path("dropped_insert.wal");
    let room = Ulid::new();
    let first = booking_on(room, at(10, 0), at(12, 0));
    {
        let engine = open(&path);
        // The caller gives up after one poll, as an expired deadline does.
        assert!(engine.insert_booking(first.clone()).now_or_never().is_none());

        let second = engine
            .insert_booking(booking_on(room, at(11, 0), at(13, 0)))
            .await;
        assert!(matches!(second, Err(EngineError::Overlap { .. })));
        assert_eq!(engine.get_booking(&first.id).await, Some(first.clone()));
    }

    let engine = open(&path);
    let busy = engine
        .busy_spans(&room, &Span::from_instants(at(9, 0), at(13, 0)))
        .await;
    assert_eq!(busy, vec![first.span()]);
}

// ── Payment intents ──────────────────────────────────────

#[tokio::test]
async fn duplicate_invoice_rejected() {
    let engine = open(&test_wal_path("dup_invoice.wal"));
    let intent = intent_for(Ulid::new(), 42, "300.00");
    engine.insert_intent(intent.clone()).await.unwrap();
    let result = engine.insert_intent(intent).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(_))));
    assert_eq!(engine.intent_count(), 1);
}

#[tokio::test]
async fn modify_intent_persists() {
    let path = test_wal_path("modify_intent.wal");
    {
        let engine = open(&path);
        engine
            .insert_intent(intent_for(Ulid::new(), 7, "300.00"))
            .await
            .unwrap();
        let (paid, changed, ()) = engine
            .modify_intent(7, |intent| {
                intent.status = IntentStatus::Paid;
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(paid.status, IntentStatus::Paid);
    }

    let engine = open(&path);
    assert_eq!(engine.get_intent(7).await.unwrap().status, IntentStatus::Paid);
}

#[tokio::test]
async fn held_invoice_lock_times_out() {
    let config = EngineConfig {
        lock_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let engine = Engine::new(test_wal_path("lock_timeout.wal"), config).unwrap();
    engine
        .insert_intent(intent_for(Ulid::new(), 9, "10"))
        .await
        .unwrap();

    let slot = engine.get_intent_slot(9).unwrap();
    let _held = slot.lock().await;
    let result = engine
        .modify_intent(9, |_| Ok::<_, EngineError>(()))
        .await;
    assert!(matches!(result, Err(EngineError::LockTimeout)));
}

#[tokio::test]
async fn concurrent_intent_updates_serialize() {
    let engine = Arc::new(open(&test_wal_path("intent_serialize.wal")));
    engine
        .insert_intent(intent_for(Ulid::new(), 11, "10"))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.modify_intent(11, |intent| {
                if intent.status == IntentStatus::Paid {
                    return Ok::<_, EngineError>(false);
                }
                intent.status = IntentStatus::Paid;
                Ok(true)
            })
            .await
            .unwrap()
        }));
    }

    let mut transitions = 0;
    for h in handles {
        let (_, changed, applied) = h.await.unwrap();
        assert_eq!(changed, applied);
        if applied {
            transitions += 1;
        }
    }
    assert_eq!(transitions, 1);
}

#[tokio::test]
async fn intent_update_dropped_after_first_poll_applies_once() {
    let path = test_wal_path("dropped_intent_update.wal");
    let engine = open(&path);
    engine
        .insert_intent(intent_for(Ulid::new(), 13, "10"))
        .await
        .unwrap();

    let mark_paid = |intent: &mut PaymentIntent| {
        if intent.status == IntentStatus::Paid {
            return Ok::<_, EngineError>(false);
        }
        intent.status = IntentStatus::Paid;
        Ok(true)
    };
    assert!(engine.modify_intent(13, mark_paid).now_or_never().is_none());

    let (current, changed, applied) = engine.modify_intent(13, mark_paid).await.unwrap();
    assert!(!changed);
    assert!(!applied);
    assert_eq!(current.status, IntentStatus::Paid);

    drop(engine);
    assert_eq!(open(&path).get_intent(13).await.unwrap().status, IntentStatus::Paid);
}

// ── WAL replay and compaction ────────────────────────────

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(open(&path));

    let n = 20;
    let mut handles = Vec::new();
    for _ in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.insert_booking(booking_on(Ulid::new(), at(9, 0), at(10, 0)))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.booking_count(), n);

    let engine2 = open(&path);
    assert_eq!(engine2.booking_count(), n);
}

#[tokio::test]
async fn replay_restores_latest_state() {
    let path = test_wal_path("replay_latest.wal");
    let room = Ulid::new();
    let b = booking_on(room, at(10, 0), at(11, 0));
    {
        let engine = open(&path);
        engine.insert_booking(b.clone()).await.unwrap();
        engine
            .modify_booking(b.id, |booking| {
                booking.status = BookingStatus::Confirmed;
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap();
    }

    let engine = open(&path);
    let restored = engine.get_booking(&b.id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Confirmed);
    // Exclusion still applies after restart.
    let result = engine
        .insert_booking(booking_on(room, at(10, 30), at(11, 30)))
        .await;
    assert!(matches!(result, Err(EngineError::Overlap { .. })));
}

#[tokio::test]
async fn compact_on_open_past_threshold() {
    let path = test_wal_path("compact_on_open.wal");
    let b = booking_on(Ulid::new(), at(10, 0), at(11, 0));
    {
        let engine = open(&path);
        engine.insert_booking(b.clone()).await.unwrap();
        for status in [BookingStatus::Confirmed, BookingStatus::Completed] {
            engine
                .modify_booking(b.id, |booking| {
                    booking.status = status;
                    Ok::<_, EngineError>(())
                })
                .await
                .unwrap();
        }
    }
    let size_before = std::fs::metadata(&path).unwrap().len();

    let config = EngineConfig {
        compact_threshold: 2,
        ..EngineConfig::default()
    };
    let engine = Engine::new(path.clone(), config).unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "{size_after} < {size_before}");
    assert_eq!(
        engine.get_booking(&b.id).await.unwrap().status,
        BookingStatus::Completed
    );
    assert_eq!(crate::wal::Wal::<Event>::replay(&path).unwrap().len(), 1);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let b = booking_on(Ulid::new(), at(10, 0), at(11, 0));
    {
        let engine = open(&path);
        engine.insert_booking(b.clone()).await.unwrap();
        engine
            .insert_intent(intent_for(b.id, 5, "300"))
            .await
            .unwrap();
        engine
            .modify_intent(5, |intent| {
                intent.status = IntentStatus::Pending;
                Ok::<_, EngineError>(())
            })
            .await
            .unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Append after compaction lands in the new file.
        engine
            .insert_booking(booking_on(Ulid::new(), at(12, 0), at(13, 0)))
            .await
            .unwrap();
    }

    let engine = open(&path);
    assert_eq!(engine.booking_count(), 2);
    assert_eq!(engine.get_intent(5).await.unwrap().status, IntentStatus::Pending);
}
