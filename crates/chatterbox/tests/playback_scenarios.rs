//! Clip playback end to end on simulated hardware.
//!
//! Blocks are 512 frames at 8 kHz (64 ms) and the sim sink is paced, so
//! timings here are real time.

mod common;

use std::time::{Duration, Instant};

use anyhow::Result;
use chatterbox::sim::{ActuatorCommand, SinkEvent};
use chatterbox::{ChatterError, JobState, Owner};
use chatterconf::{PlayPolicy, Settings};
use common::{wait_for, Rig};

const BLOCK: Duration = Duration::from_millis(64);
const SLACK: Duration = Duration::from_millis(120);

fn wait_playing(rig: &Rig) -> bool {
    wait_for(Duration::from_secs(1), || {
        rig.board.playback_status().state == Some(JobState::Playing)
    })
}

#[test]
fn test_clip_at_minus_3_db_finishes_with_mouth_closed() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("hello.wav", 0.5, 0.5)?;

    let id = rig.board.play("hello.wav", Some(-3.0))?;
    assert!(wait_playing(&rig), "job never started playing");
    assert!(rig.board.wait_playback_idle(Duration::from_secs(3)));

    let status = rig.board.playback_status();
    assert_eq!(status.job_id, Some(id));
    assert_eq!(status.state, Some(JobState::Finished));
    assert!((status.elapsed - 0.5).abs() < 0.01);

    let peak = rig
        .backend
        .written_samples()
        .iter()
        .fold(0.0f32, |m, s| m.max(s.abs()));
    assert!((peak - 0.5 * 0.708).abs() < 0.01, "peak {peak}");

    rig.board.servo().barrier();
    let commands = rig.actuator.commands();
    assert!(commands
        .iter()
        .any(|c| matches!(c, ActuatorCommand::Angle(a) if *a > 5.0)));
    assert_eq!(
        &commands[commands.len() - 3..],
        [
            ActuatorCommand::Angle(5.0),
            ActuatorCommand::Release,
            ActuatorCommand::Power(false)
        ]
    );
    assert_eq!(rig.actuator.last_angle(), Some(5.0));
    Ok(())
}

#[test]
fn test_live_rejected_while_clip_plays() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("long.wav", 2.0, 0.3)?;
    rig.board.play("long.wav", None)?;
    assert!(wait_playing(&rig));

    let err = rig.board.start_live().unwrap_err();
    assert_eq!(err, ChatterError::DeviceBusy { holder: Owner::Playback });
    assert_eq!(rig.board.live_status().state, chatterbox::SessionState::Stopped);
    assert_eq!(rig.backend.open_sources(), 0);

    rig.board.stop(true);
    Ok(())
}

#[test]
fn test_preempt_replaces_active_job() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("a.wav", 2.0, 0.3)?;
    rig.clip("b.wav", 0.3, 0.3)?;

    let first = rig.board.play("a.wav", None)?;
    assert!(wait_playing(&rig));
    let second = rig.board.play("b.wav", None)?;
    assert_ne!(first, second);
    assert_eq!(rig.board.playback_status().job_id, Some(second));
    assert!(rig.backend.open_sinks() <= 1);

    assert!(rig.board.wait_playback_idle(Duration::from_secs(2)));
    assert_eq!(rig.board.playback_status().state, Some(JobState::Finished));
    let aborted = rig
        .backend
        .events()
        .iter()
        .filter(|e| **e == SinkEvent::Aborted)
        .count();
    assert_eq!(aborted, 1);
    Ok(())
}

#[test]
fn test_reject_policy_keeps_active_job() -> Result<()> {
    let mut settings = Settings::default();
    settings.playback.policy = PlayPolicy::Reject;
    let rig = Rig::with(settings, chatterbox::sim::SimEffect::Scale(1.0))?;
    rig.clip("a.wav", 2.0, 0.3)?;
    rig.clip("b.wav", 0.3, 0.3)?;

    let first = rig.board.play("a.wav", None)?;
    assert!(wait_playing(&rig));
    let err = rig.board.play("b.wav", None).unwrap_err();
    assert_eq!(err, ChatterError::DeviceBusy { holder: Owner::Playback });

    let status = rig.board.playback_status();
    assert_eq!(status.job_id, Some(first));
    assert_eq!(status.state, Some(JobState::Playing));
    rig.board.stop(true);
    Ok(())
}

#[test]
fn test_rapid_requests_never_open_two_sinks() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("a.wav", 1.0, 0.3)?;
    for _ in 0..6 {
        rig.board.play("a.wav", None)?;
        assert!(rig.backend.open_sinks() <= 1);
        std::thread::sleep(Duration::from_millis(10));
    }
    rig.board.stop(true);
    assert!(rig.board.wait_playback_idle(Duration::from_secs(1)));
    assert_eq!(rig.backend.open_sinks(), 0);
    Ok(())
}

#[test]
fn test_hard_stop_within_one_block() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("long.wav", 3.0, 0.3)?;
    rig.board.play("long.wav", None)?;
    assert!(wait_playing(&rig));

    let started = Instant::now();
    assert!(rig.board.stop(true));
    assert!(rig.board.wait_playback_idle(Duration::from_secs(1)));
    let took = started.elapsed();
    assert!(took <= BLOCK + SLACK, "hard stop took {took:?}");

    assert_eq!(rig.board.playback_status().state, Some(JobState::Stopped));
    assert!(rig.backend.events().contains(&SinkEvent::Aborted));
    assert_eq!(rig.backend.open_sinks(), 0);

    // device is free again
    rig.board.start_live()?;
    assert!(rig.board.stop_live());
    assert!(rig.board.wait_live_idle(Duration::from_secs(1)));
    Ok(())
}

#[test]
fn test_soft_stop_drains() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("long.wav", 3.0, 0.3)?;
    rig.board.play("long.wav", None)?;
    assert!(wait_playing(&rig));

    let started = Instant::now();
    assert!(rig.board.stop(false));
    assert!(rig.board.wait_playback_idle(Duration::from_secs(1)));
    let took = started.elapsed();
    assert!(took <= BLOCK * 2 + SLACK, "soft stop took {took:?}");

    let events = rig.backend.events();
    assert!(events.contains(&SinkEvent::Drained));
    assert!(!events.contains(&SinkEvent::Aborted));
    assert_eq!(rig.board.playback_status().state, Some(JobState::Stopped));
    assert!(!rig.board.stop(false), "nothing left to stop");
    Ok(())
}

#[test]
fn test_disabled_servo_only_closes_then_resumes() -> Result<()> {
    let rig = Rig::new()?;
    rig.clip("hello.wav", 0.5, 0.5)?;

    let mut servo = rig.board.servo_settings();
    servo.enabled = false;
    assert!(!rig.board.update_servo_settings(servo.clone())?.restart_required);

    rig.board.play("hello.wav", None)?;
    assert!(rig.board.wait_playback_idle(Duration::from_secs(3)));
    rig.board.servo().barrier();
    assert_eq!(
        rig.actuator.commands(),
        [
            ActuatorCommand::Angle(5.0),
            ActuatorCommand::Release,
            ActuatorCommand::Power(false)
        ]
    );

    rig.actuator.clear();
    servo.enabled = true;
    rig.board.update_servo_settings(servo)?;
    rig.board.play("hello.wav", None)?;
    assert!(rig.board.wait_playback_idle(Duration::from_secs(3)));
    rig.board.servo().barrier();
    let commands = rig.actuator.commands();
    assert_eq!(commands[0], ActuatorCommand::Power(true));
    assert!(commands
        .iter()
        .any(|c| matches!(c, ActuatorCommand::Angle(a) if *a > 5.0)));
    Ok(())
}

#[test]
fn test_unknown_track_is_decode_failure() -> Result<()> {
    let rig = Rig::new()?;
    let err = rig.board.play("missing.wav", None).unwrap_err();
    assert!(matches!(err, ChatterError::DecodeFailure(_)));
    assert!(rig.board.last_error().is_some());
    assert_eq!(rig.backend.open_sinks(), 0);
    Ok(())
}
