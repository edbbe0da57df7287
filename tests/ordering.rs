mod common;

use std::time::Duration;

use capture_reconciler::{
    BufferHandle, CaptureRequest, Error, RequestState, ResultEvent, ResultKind, SequenceId,
    StreamBuffer, StreamClass, StreamId,
};
use common::{manager, start, stream, wait_until, Delivered, TIMEOUT};
use proptest::prelude::*;

fn buffer(id: SequenceId, stream: StreamId) -> ResultEvent {
    ResultEvent::buffer(id, stream, BufferHandle(id.0))
}

fn all_events(id: SequenceId, outputs: &[StreamId]) -> Vec<ResultEvent> {
    let mut events = vec![
        ResultEvent::shutter(id, id.0 * 1000),
        ResultEvent::partial(id, "3a"),
        ResultEvent::final_metadata(id, "meta"),
    ];
    events.extend(outputs.iter().map(|s| buffer(id, *s)));
    events
}

#[test]
fn shutters_are_delivered_in_submission_order() {
    let (manager, recorder) = manager(&[]);
    let ids = start(&manager, &[&[], &[], &[], &[], &[]]);

    for id in ids.iter().rev() {
        manager.submit(ResultEvent::shutter(*id, 0)).unwrap();
    }

    assert!(wait_until(TIMEOUT, || recorder.notifies().len() == ids.len()));
    assert_eq!(recorder.notifies(), ids);
}

#[test]
fn buffers_follow_submission_order_per_stream() {
    let preview = stream(StreamClass::Preview);
    let video = stream(StreamClass::Video);
    let (manager, recorder) = manager(&[preview, video]);
    let both = [preview.id, video.id];
    let ids = start(&manager, &[&both, &both, &both]);

    for id in &ids {
        manager.submit(ResultEvent::shutter(*id, 0)).unwrap();
    }
    // Newest first, alternating streams.
    for id in ids.iter().rev() {
        manager.submit(buffer(*id, video.id)).unwrap();
        manager.submit(buffer(*id, preview.id)).unwrap();
    }

    assert!(wait_until(TIMEOUT, || recorder.buffers_on(video.id).len() == 3
        && recorder.buffers_on(preview.id).len() == 3));
    assert_eq!(recorder.buffers_on(preview.id), ids);
    assert_eq!(recorder.buffers_on(video.id), ids);
    assert_eq!(manager.watermark(preview.id), Some(ids[2]));
}

#[test]
fn results_wait_for_their_shutter() {
    let preview = stream(StreamClass::Preview);
    let (manager, recorder) = manager(&[preview]);
    let id = start(&manager, &[&[preview.id]])[0];

    manager.submit(ResultEvent::partial(id, "3a")).unwrap();
    manager.submit(ResultEvent::final_metadata(id, "meta")).unwrap();
    manager.submit(buffer(id, preview.id)).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert!(recorder.log().is_empty());

    manager.submit(ResultEvent::shutter(id, 7)).unwrap();
    assert!(wait_until(TIMEOUT, || recorder.len() == 4));
    assert_eq!(recorder.log()[0], Delivered::Notify(id));

    // The shutter callback runs before the request leaves Dispatched; every
    // later callback sees the shutter committed.
    for (seq, kind, state) in recorder.states() {
        assert_eq!(seq, id);
        match kind {
            ResultKind::Notify => assert_eq!(state, RequestState::Dispatched),
            _ => assert_ne!(state, RequestState::Dispatched),
        }
    }
    assert!(wait_until(TIMEOUT, || manager.running_count() == 0));
}

#[test]
fn later_shutter_waits_for_earlier_request() {
    let x = stream(StreamClass::Preview);
    let y = stream(StreamClass::Video);
    let (manager, recorder) = manager(&[x, y]);
    let both = [x.id, y.id];
    let ids = start(&manager, &[&both, &both, &both]);
    let (r1, r2, r3) = (ids[0], ids[1], ids[2]);

    manager.submit(ResultEvent::shutter(r1, 1)).unwrap();
    manager.submit(buffer(r1, y.id)).unwrap();
    manager.submit(buffer(r1, x.id)).unwrap();
    manager.submit(ResultEvent::shutter(r3, 3)).unwrap();
    manager.submit(buffer(r3, x.id)).unwrap();
    manager.submit(buffer(r2, x.id)).unwrap();

    assert!(wait_until(TIMEOUT, || recorder.buffers_on(x.id) == vec![r1]
        && recorder.buffers_on(y.id) == vec![r1]));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(recorder.notifies(), vec![r1]);

    manager.submit(ResultEvent::partial(r1, "3a")).unwrap();
    manager.submit(ResultEvent::final_metadata(r1, "meta")).unwrap();
    assert!(wait_until(TIMEOUT, || !manager.in_flight().contains(&r1)));
    assert!(recorder.buffers_on(x.id).iter().all(|id| *id == r1));

    manager.submit(ResultEvent::shutter(r2, 2)).unwrap();
    for event in [
        buffer(r2, y.id),
        buffer(r3, y.id),
        ResultEvent::partial(r2, "3a"),
        ResultEvent::final_metadata(r2, "meta"),
        ResultEvent::partial(r3, "3a"),
        ResultEvent::final_metadata(r3, "meta"),
    ] {
        manager.submit(event).unwrap();
    }

    assert!(wait_until(TIMEOUT, || manager.running_count() == 0));
    assert_eq!(recorder.notifies(), ids);
    assert_eq!(recorder.buffers_on(x.id), ids);
    assert_eq!(recorder.buffers_on(y.id), ids);
    assert!(manager.in_flight().is_empty());
}

#[test]
fn zero_buffer_request_completes_on_metadata() {
    let (manager, recorder) = manager(&[stream(StreamClass::Preview)]);
    let id = start(&manager, &[&[]])[0];

    manager.submit(ResultEvent::shutter(id, 1)).unwrap();
    assert!(wait_until(TIMEOUT, || manager
        .with_request(id, |req| req.state())
        .map(|state| state == RequestState::BufferComplete)
        .unwrap_or(false)));

    manager.submit(ResultEvent::partial(id, "3a")).unwrap();
    manager.submit(ResultEvent::final_metadata(id, "meta")).unwrap();
    assert!(wait_until(TIMEOUT, || manager.running_count() == 0));
    assert_eq!(recorder.len(), 3);
    assert!(wait_until(TIMEOUT, || manager.telemetry().reclaimed == 1));
}

#[test]
fn duplicate_results_are_delivered_once() {
    let preview = stream(StreamClass::Preview);
    let (manager, recorder) = manager(&[preview]);
    let id = start(&manager, &[&[preview.id]])[0];

    manager.submit(ResultEvent::shutter(id, 1)).unwrap();
    assert!(matches!(
        manager.submit(ResultEvent::shutter(id, 2)),
        Err(Error::StaleEvent { kind: ResultKind::Notify, .. })
    ));
    assert!(wait_until(TIMEOUT, || recorder.notifies().len() == 1));
    assert!(matches!(
        manager.submit(ResultEvent::shutter(id, 3)),
        Err(Error::StaleEvent { .. })
    ));

    let jpeg = StreamId::new(StreamClass::Jpeg, 0).unwrap();
    assert!(matches!(
        manager.submit(buffer(id, jpeg)),
        Err(Error::StaleEvent { .. })
    ));
    assert!(matches!(
        manager.submit(ResultEvent::shutter(SequenceId(999), 0)),
        Err(Error::NotFound(_))
    ));

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(recorder.notifies(), vec![id]);
    assert_eq!(manager.telemetry().stale_events, 4);
}

#[test]
fn reclaim_is_idempotent() {
    let (manager, recorder) = manager(&[]);
    let id = start(&manager, &[&[]])[0];
    for event in all_events(id, &[]) {
        manager.submit(event).unwrap();
    }
    assert!(wait_until(TIMEOUT, || manager.telemetry().reclaimed == 1));
    assert_eq!(manager.running_count(), 0);

    assert!(matches!(manager.reclaim(id), Err(Error::NotFound(_))));
    assert!(matches!(manager.reclaim(id), Err(Error::NotFound(_))));
    assert!(matches!(
        manager.submit(ResultEvent::partial(id, "late")),
        Err(Error::NotFound(_))
    ));
    assert_eq!(recorder.len(), 3);
    assert_eq!(manager.telemetry().reclaimed, 1);
}

#[test]
fn incomplete_request_cannot_be_reclaimed() {
    let (manager, _recorder) = manager(&[]);
    let id = start(&manager, &[&[]])[0];
    manager.submit(ResultEvent::shutter(id, 1)).unwrap();
    assert!(matches!(manager.reclaim(id), Err(Error::Incomplete { .. })));
    assert_eq!(manager.running_count(), 1);
}

#[test]
fn final_result_carries_depth_and_input_buffer() {
    let preview = stream(StreamClass::Preview);
    let zsl_in = stream(StreamClass::ZslInput);
    let (manager, recorder) = manager(&[preview, zsl_in]);

    let input = StreamBuffer::new(zsl_in.id, BufferHandle(0xfeed));
    let first = manager
        .enqueue(common::capture(&[preview.id]).with_input(input))
        .unwrap();
    manager.dispatch_next().unwrap();
    let second = start(&manager, &[&[preview.id]])[0];

    for event in all_events(first, &[preview.id]) {
        manager.submit(event).unwrap();
    }
    assert!(wait_until(TIMEOUT, || recorder.finals().len() == 1));

    let result = &recorder.finals()[0];
    assert_eq!(result.sequence_id, first);
    assert_eq!(result.pipeline_depth, 1);
    assert_eq!(result.input_buffer, Some(input));
    assert_eq!(
        manager.with_request(second, |req| req.pipeline_depth()).unwrap(),
        0
    );
}

#[test]
fn frame_counts_resolve_until_reclaimed() {
    let (manager, _recorder) = manager(&[]);
    let id = start(&manager, &[&[]])[0];
    manager.bind_frame_count(12, id).unwrap();
    assert_eq!(manager.resolve_frame_count(12), Some(id));

    for event in all_events(id, &[]) {
        manager.submit(event).unwrap();
    }
    assert!(wait_until(TIMEOUT, || manager.running_count() == 0));
    assert_eq!(manager.resolve_frame_count(12), None);
}

#[test]
fn pending_head_blocks_later_shutters() {
    let (manager, recorder) = manager(&[]);
    let first = manager.enqueue(common::capture(&[])).unwrap();
    let second = manager.enqueue(CaptureRequest::new()).unwrap();
    assert_eq!(manager.in_flight(), vec![first, second]);

    // Dispatch both, complete only the second.
    manager.dispatch_next().unwrap();
    manager.dispatch_next().unwrap();
    manager.submit(ResultEvent::shutter(second, 2)).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    assert!(recorder.notifies().is_empty());

    manager.submit(ResultEvent::shutter(first, 1)).unwrap();
    assert!(wait_until(TIMEOUT, || recorder.notifies() == vec![first, second]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn any_arrival_order_preserves_delivery_order(keys in prop::collection::vec(any::<u32>(), 4 * 5)) {
        let preview = stream(StreamClass::Preview);
        let jpeg = stream(StreamClass::Jpeg);
        let (manager, recorder) = manager(&[preview, jpeg]);
        let outputs: [&[StreamId]; 4] = [&[preview.id], &[preview.id, jpeg.id], &[], &[jpeg.id]];
        let ids = start(&manager, &outputs);

        let mut events: Vec<ResultEvent> = ids
            .iter()
            .zip(outputs)
            .flat_map(|(id, outs)| all_events(*id, outs))
            .collect();
        let mut order: Vec<(u32, usize)> = keys.iter().copied().zip(0..events.len()).collect();
        order.sort();
        let mut shuffled = Vec::with_capacity(events.len());
        for (_, index) in order {
            shuffled.push(std::mem::replace(&mut events[index], ResultEvent::shutter(SequenceId(0), 0)));
        }
        for event in shuffled {
            manager.submit(event).unwrap();
        }

        prop_assert!(wait_until(TIMEOUT, || manager.running_count() == 0));
        prop_assert_eq!(recorder.notifies(), ids.clone());
        prop_assert_eq!(recorder.buffers_on(preview.id), vec![ids[0], ids[1]]);
        prop_assert_eq!(recorder.buffers_on(jpeg.id), vec![ids[1], ids[3]]);
        prop_assert_eq!(recorder.len(), 4 * 3 + 4);
    }
}

#[test]
fn missing_shutter_is_reported_as_a_stall() {
    let (manager, recorder) = manager(&[]);
    let stuck = start(&manager, &[&[]])[0];
    let behind = start(&manager, &[&[]])[0];
    manager.submit(ResultEvent::shutter(behind, 1)).unwrap();

    assert!(wait_until(TIMEOUT, || manager.telemetry().stalls > 0));
    assert!(recorder.notifies().is_empty());
    assert_eq!(manager.in_flight(), vec![stuck, behind]);
    assert!(manager.dump().contains(&stuck.to_string()));

    manager.submit(ResultEvent::shutter(stuck, 0)).unwrap();
    assert!(wait_until(TIMEOUT, || recorder.notifies() == vec![stuck, behind]));
}
