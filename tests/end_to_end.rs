//! Full annotation loop scenarios exercised against the engine with the
//! simulator segmenter and a synthetic frame source.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use maskflow::{
    AddObjectRequest, AnnotationEngine, EngineError, Job, JobStatus, Mask, OpenSessionRequest,
    OrchestratorSettings, OverrideMaskRequest, PropagateRequest, SimulatorSegmenter,
    SyntheticFrameSource,
};

fn engine_with(
    settings: OrchestratorSettings,
    source: SyntheticFrameSource,
    segmenter: SimulatorSegmenter,
) -> AnnotationEngine {
    AnnotationEngine::new(settings, Arc::new(source), Arc::new(segmenter))
}

fn open(engine: &AnnotationEngine, video: &str) -> String {
    engine
        .open_session(&OpenSessionRequest {
            video_path: video.to_string(),
        })
        .unwrap()
        .session_id
}

fn add_point_object(engine: &AnnotationEngine, session_id: &str, point: [f32; 2]) {
    engine
        .add_object(session_id, &AddObjectRequest {
            frame_idx: 0,
            object_id: 1,
            points: vec![point],
            labels: vec![1],
            name: None,
            category: None,
        })
        .unwrap();
}

fn wait_for_terminal(engine: &AnnotationEngine, job_id: &str) -> Job {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let job = engine.job(job_id).unwrap();
        if job.status.is_terminal() {
            return job;
        }
        assert!(Instant::now() < deadline, "job did not finish in time");
        thread::sleep(Duration::from_millis(10));
    }
}

fn all_masks(
    engine: &AnnotationEngine,
    session_id: &str,
    total_frames: usize,
) -> Vec<BTreeMap<u32, Mask>> {
    (0..total_frames)
        .map(|frame_idx| engine.get_frame_masks(session_id, frame_idx).unwrap())
        .collect()
}

#[test]
fn open_add_propagate_read() {
    let settings = OrchestratorSettings {
        max_video_frames: 100,
        max_workers: 1,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(640, 480, 30.0, 100),
        SimulatorSegmenter::new(),
    );

    let opened = engine
        .open_session(&OpenSessionRequest {
            video_path: "clip.mp4".to_string(),
        })
        .unwrap();
    assert_eq!(opened.total_frames, 100);
    assert_eq!((opened.frame_width, opened.frame_height), (640, 480));
    assert_eq!(opened.fps, 30.0);

    let object = engine
        .add_object(&opened.session_id, &AddObjectRequest {
            frame_idx: 0,
            object_id: 1,
            points: vec![[320.0, 240.0]],
            labels: vec![1],
            name: None,
            category: None,
        })
        .unwrap();
    let mask = Mask::from_png_base64(&object.mask).unwrap();
    assert_eq!((mask.width(), mask.height()), (640, 480));
    assert!(mask.coverage() > 0);

    let job_id = engine
        .start_propagation(&opened.session_id, &PropagateRequest::default())
        .unwrap();
    let job = wait_for_terminal(&engine, &job_id);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100.0);

    let masks = engine.get_frame_masks(&opened.session_id, 50).unwrap();
    let mask = &masks[&1];
    assert_eq!((mask.width(), mask.height()), (640, 480));
}

#[test]
fn override_survives_repropagation() {
    let settings = OrchestratorSettings {
        max_video_frames: 40,
        max_workers: 1,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(64, 48, 30.0, 40),
        SimulatorSegmenter::new(),
    );
    let session_id = open(&engine, "clip.mp4");
    add_point_object(&engine, &session_id, [32.0, 24.0]);

    let first_job = engine
        .start_propagation(&session_id, &PropagateRequest::default())
        .unwrap();
    assert_eq!(
        wait_for_terminal(&engine, &first_job).status,
        JobStatus::Completed
    );
    assert!(engine.get_frame_masks(&session_id, 10).unwrap()[&1].coverage() > 0);

    let zeros = Mask::empty(64, 48).to_png_base64().unwrap();
    engine
        .override_mask(&session_id, 1, &OverrideMaskRequest {
            frame_idx: 10,
            mask: zeros,
        })
        .unwrap();

    let second_job = engine
        .start_propagation(&session_id, &PropagateRequest::default())
        .unwrap();
    assert_eq!(
        wait_for_terminal(&engine, &second_job).status,
        JobStatus::Completed
    );

    // The override is a seed: propagation must not repaint frame 10.
    let after = engine.get_frame_masks(&session_id, 10).unwrap();
    assert!(after[&1].is_empty_mask());
    // Frames nearer the original seed still carry propagated masks.
    assert!(engine.get_frame_masks(&session_id, 4).unwrap()[&1].coverage() > 0);
}

#[test]
fn propagation_is_idempotent_without_new_prompts() {
    let settings = OrchestratorSettings {
        max_video_frames: 30,
        max_workers: 1,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(64, 48, 30.0, 30),
        SimulatorSegmenter::new(),
    );
    let session_id = open(&engine, "clip.mp4");
    add_point_object(&engine, &session_id, [32.0, 24.0]);

    let first = engine
        .start_propagation(&session_id, &PropagateRequest::default())
        .unwrap();
    wait_for_terminal(&engine, &first);
    let first_masks = all_masks(&engine, &session_id, 30);

    let second = engine
        .start_propagation(&session_id, &PropagateRequest::default())
        .unwrap();
    wait_for_terminal(&engine, &second);
    let second_masks = all_masks(&engine, &session_id, 30);

    assert_eq!(first_masks, second_masks);
}

#[test]
fn admission_cap_names_the_limit() {
    let settings = OrchestratorSettings {
        max_concurrent_sessions: 2,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(32, 32, 30.0, 3),
        SimulatorSegmenter::new(),
    );

    open(&engine, "a.mp4");
    open(&engine, "b.mp4");
    let err = engine
        .open_session(&OpenSessionRequest {
            video_path: "c.mp4".to_string(),
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { limit: 2 }));
    assert!(err.to_string().contains("(2)"));
}

#[test]
fn idle_sessions_are_evicted_and_their_scratch_dirs_removed() {
    let settings = OrchestratorSettings {
        session_timeout_seconds: 0,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(32, 32, 30.0, 3),
        SimulatorSegmenter::new(),
    );

    let session_id = open(&engine, "idle.mp4");
    let info = engine.session_info(&session_id).unwrap();
    assert!(info.idle_seconds < 1.0);
    thread::sleep(Duration::from_millis(30));

    assert_eq!(engine.sweep_expired_sessions(), 1);
    assert!(matches!(
        engine.session_info(&session_id),
        Err(EngineError::SessionNotFound(_))
    ));
    assert_eq!(engine.session_count(), 0);
}

#[test]
fn propagation_keeps_the_session_alive_past_the_idle_timeout() {
    let settings = OrchestratorSettings {
        session_timeout_seconds: 1,
        touch_every: 5,
        max_video_frames: 200,
        max_workers: 1,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(32, 32, 30.0, 150),
        // 150 frames at 20ms per frame: the run outlives the 1s timeout.
        SimulatorSegmenter::with_frame_delay(Duration::from_millis(20)),
    );
    let session_id = open(&engine, "slow.mp4");
    add_point_object(&engine, &session_id, [16.0, 16.0]);

    let job_id = engine
        .start_propagation(&session_id, &PropagateRequest::default())
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let job = engine.job(&job_id).unwrap();
        if job.status.is_terminal() {
            assert_eq!(job.status, JobStatus::Completed);
            break;
        }
        // Interleaved sweeps must never find the session idle.
        assert_eq!(engine.sweep_expired_sessions(), 0);
        assert_eq!(engine.session_count(), 1);
        assert!(Instant::now() < deadline, "propagation never finished");
        thread::sleep(Duration::from_millis(100));
    }

    assert!(engine.session_info(&session_id).is_ok());
}

#[test]
fn bad_input_is_rejected_without_touching_session_state() {
    let engine = engine_with(
        OrchestratorSettings::default(),
        SyntheticFrameSource::new(32, 32, 30.0, 5),
        SimulatorSegmenter::new(),
    );
    let session_id = open(&engine, "fresh.mp4");

    // total_frames is 5, so frame 5 is one past the valid range.
    let err = engine
        .add_object(&session_id, &AddObjectRequest {
            frame_idx: 5,
            object_id: 1,
            points: vec![[1.0, 1.0]],
            labels: vec![1],
            name: None,
            category: None,
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));

    let info = engine.session_info(&session_id).unwrap();
    assert!(info.objects.is_empty());
    // The session is still fully usable.
    assert!(engine.get_frame_masks(&session_id, 0).unwrap().is_empty());
}

#[test]
fn boundary_frames_are_valid_and_past_the_end_is_not() {
    let engine = engine_with(
        OrchestratorSettings::default(),
        SyntheticFrameSource::new(32, 32, 30.0, 5),
        SimulatorSegmenter::new(),
    );
    let session_id = open(&engine, "bounds.mp4");

    engine
        .add_object(&session_id, &AddObjectRequest {
            frame_idx: 0,
            object_id: 1,
            points: vec![[16.0, 16.0]],
            labels: vec![1],
            name: None,
            category: None,
        })
        .unwrap();
    engine
        .add_object(&session_id, &AddObjectRequest {
            frame_idx: 4,
            object_id: 2,
            points: vec![[8.0, 8.0]],
            labels: vec![1],
            name: None,
            category: None,
        })
        .unwrap();

    assert!(engine.get_frame_masks(&session_id, 4).unwrap().contains_key(&2));
    assert!(matches!(
        engine.get_frame_masks(&session_id, 5),
        Err(EngineError::InvalidArgument(_))
    ));
}

#[test]
fn close_is_idempotent_and_frees_capacity() {
    let settings = OrchestratorSettings {
        max_concurrent_sessions: 1,
        ..OrchestratorSettings::default()
    };
    let engine = engine_with(
        settings,
        SyntheticFrameSource::new(32, 32, 30.0, 3),
        SimulatorSegmenter::new(),
    );

    let first = open(&engine, "a.mp4");
    assert!(engine.close_session(&first));
    assert!(!engine.close_session(&first));

    // Capacity freed: a new session admits.
    let second = open(&engine, "b.mp4");
    assert_ne!(first, second);
}
