use std::time::Duration;

use lunar_debug::wire::mock::{MockDebuggee, MockDebuggeeConfig};
use lunar_debug::wire::CommandName;
use lunar_debug::{
    DebugError, DebugSession, ErrorKind, OutputMode, OutputStream, PauseLocation, SessionConfig,
    SessionEvent, SessionState,
};
use pretty_assertions::assert_eq;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    oneshot,
};

async fn wait_for_state(
    session: &DebugSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    want: SessionState,
) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if session.state() == want {
                return;
            }
            match events.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "never reached {want}; stuck in {}", session.state());
}

async fn next_matching<T>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut pick: impl FnMut(SessionEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("session event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Attaches to a mock that reports being paused at `main.lua:42`.
async fn paused_session(
    config: MockDebuggeeConfig,
    session_config: SessionConfig,
) -> (MockDebuggee, DebugSession, broadcast::Receiver<SessionEvent>) {
    let mock = MockDebuggee::spawn_with_config(MockDebuggeeConfig {
        start: PauseLocation::new("main.lua", 42),
        pause_on_connect: true,
        ..config
    })
    .await
    .unwrap();
    let session = DebugSession::new(session_config);
    let mut events = session.subscribe();
    session.attach(mock.addr()).await.unwrap();
    wait_for_state(&session, &mut events, SessionState::Paused).await;
    (mock, session, events)
}

#[tokio::test]
async fn pause_step_over_and_pause_again() {
    let (mock, session, mut events) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.frame, 0);
    assert_eq!(snapshot.location, Some(PauseLocation::new("main.lua", 42)));

    session.step_over().await.unwrap();
    let stepping = next_matching(&mut events, |event| match event {
        SessionEvent::StateChanged(s) if s.state == SessionState::Stepping => Some(s),
        _ => None,
    })
    .await;
    assert_eq!(stepping.location, None);

    wait_for_state(&session, &mut events, SessionState::Paused).await;
    assert_eq!(
        session.snapshot().location,
        Some(PauseLocation::new("main.lua", 43))
    );
    assert!(mock.received().contains(&"OVER".to_string()));
}

#[tokio::test]
async fn stepping_off_the_end_terminates() {
    let (_mock, session, mut events) = paused_session(
        MockDebuggeeConfig {
            steps_terminate: true,
            ..MockDebuggeeConfig::default()
        },
        SessionConfig::default(),
    )
    .await;

    session.step_into().await.unwrap();
    wait_for_state(&session, &mut events, SessionState::Terminated).await;

    let err = session.run().await.unwrap_err();
    assert!(matches!(err, DebugError::InvalidState { .. }));
}

#[tokio::test]
async fn run_until_breakpoint() {
    let mock = MockDebuggee::spawn_with_config(MockDebuggeeConfig {
        pause_on_connect: true,
        run_pauses_at: Some(PauseLocation::new("game/update.lua", 7)),
        ..MockDebuggeeConfig::default()
    })
    .await
    .unwrap();
    let session = DebugSession::default();
    let mut events = session.subscribe();

    assert!(session.set_breakpoint("game/update.lua", 7).await.unwrap());
    session.attach(mock.addr()).await.unwrap();
    wait_for_state(&session, &mut events, SessionState::Paused).await;

    session.run().await.unwrap();
    let location = next_matching(&mut events, |event| match event {
        SessionEvent::StateChanged(s) if s.state == SessionState::Paused => s
            .location
            .filter(|location| location.file == "game/update.lua"),
        _ => None,
    })
    .await;
    assert_eq!(location, PauseLocation::new("game/update.lua", 7));
    assert_eq!(mock.received(), vec!["SETB game/update.lua 7", "RUN"]);
}

#[tokio::test]
async fn handshake_sends_basedir_then_pending_breakpoints() {
    let mock = MockDebuggee::spawn().await.unwrap();
    let session = DebugSession::new(SessionConfig {
        basedir: Some("/home/dev/game/".to_string()),
        ..SessionConfig::default()
    });

    session.set_breakpoint("a.lua", 1).await.unwrap();
    session.set_breakpoint("b.lua", 2).await.unwrap();
    assert!(!session.set_breakpoint("a.lua", 1).await.unwrap());
    assert!(session.clear_breakpoint("b.lua", 2).await.unwrap());
    assert_eq!(session.state(), SessionState::Disconnected);

    session.attach(mock.addr()).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(mock.received(), vec!["BASEDIR /home/dev/game/", "SETB a.lua 1"]);
}

#[tokio::test]
async fn setting_a_breakpoint_twice_sends_one_command() {
    let (mock, session, _events) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    let (first, second) = tokio::join!(
        session.set_breakpoint("main.lua", 50),
        session.set_breakpoint("main.lua", 50)
    );
    assert!(first.unwrap() ^ second.unwrap());
    assert!(!session.set_breakpoint("main.lua", 50).await.unwrap());

    let setb: Vec<_> = mock
        .received()
        .into_iter()
        .filter(|line| line.starts_with("SETB"))
        .collect();
    assert_eq!(setb, vec!["SETB main.lua 50"]);
    assert_eq!(session.breakpoints().len(), 1);
}

#[tokio::test]
async fn rejected_breakpoint_is_forgotten() {
    let (_mock, session, _events) = paused_session(
        MockDebuggeeConfig {
            reject_breakpoints: Some("no such file".to_string()),
            ..MockDebuggeeConfig::default()
        },
        SessionConfig::default(),
    )
    .await;

    let err = session.set_breakpoint("nope.lua", 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Debuggee);
    assert!(session.breakpoints().is_empty());
    assert_eq!(session.state(), SessionState::Paused);
}

#[tokio::test]
async fn breakpoint_rejected_during_attach_keeps_the_session() {
    let mock = MockDebuggee::spawn_with_config(MockDebuggeeConfig {
        reject_breakpoints: Some("no such file".to_string()),
        ..MockDebuggeeConfig::default()
    })
    .await
    .unwrap();
    let session = DebugSession::default();
    let mut events = session.subscribe();
    session.set_breakpoint("nope.lua", 1).await.unwrap();

    session.attach(mock.addr()).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.breakpoints().is_empty());

    let message = next_matching(&mut events, |event| match event {
        SessionEvent::DebuggeeError(message) => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message, "no such file");

    session.pause().await.unwrap();
    assert_eq!(session.state(), SessionState::Paused);
    assert_eq!(mock.received(), vec!["SETB nope.lua 1", "SUSPEND"]);
}

#[tokio::test]
async fn stepping_while_running_is_an_invalid_state() {
    let mock = MockDebuggee::spawn().await.unwrap();
    let session = DebugSession::default();
    session.attach(mock.addr()).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let err = session.step_over().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(err.to_string().contains("invalid state"), "{err}");
    assert!(session.evaluate(0, "x").await.is_err());
    assert_eq!(session.state(), SessionState::Running);
    assert!(mock.received().is_empty());
}

#[tokio::test]
async fn operations_before_attach_are_rejected() {
    let session = DebugSession::default();
    for err in [
        session.run().await.unwrap_err(),
        session.pause().await.map(drop).unwrap_err(),
        session.stack().await.map(drop).unwrap_err(),
        session.detach().await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            DebugError::InvalidState {
                state: SessionState::Disconnected,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn pause_suspends_a_running_debuggee() {
    let mock = MockDebuggee::spawn_with_config(MockDebuggeeConfig {
        start: PauseLocation::new("loop.lua", 3),
        ..MockDebuggeeConfig::default()
    })
    .await
    .unwrap();
    let session = DebugSession::default();
    session.attach(mock.addr()).await.unwrap();

    let location = session.pause().await.unwrap();
    assert_eq!(location, PauseLocation::new("loop.lua", 3));
    assert_eq!(session.state(), SessionState::Paused);
    assert_eq!(mock.received(), vec!["SUSPEND"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_after_pause_is_not_undone_by_the_pause_event() {
    for _ in 0..50 {
        let mock = MockDebuggee::spawn().await.unwrap();
        let session = DebugSession::default();
        session.attach(mock.addr()).await.unwrap();

        session.pause().await.unwrap();
        session.run().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(session.state(), SessionState::Running);
        let err = session.step_over().await.unwrap_err();
        assert!(err.to_string().contains("invalid state"), "{err}");
        assert_eq!(mock.received(), vec!["SUSPEND", "RUN"]);
    }
}

#[tokio::test]
async fn failed_connect_can_be_retried() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let session = DebugSession::default();
    let err = session.attach(dead_addr).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(session.state(), SessionState::Disconnected);

    let mock = MockDebuggee::spawn().await.unwrap();
    session.attach(mock.addr()).await.unwrap();
    assert_eq!(session.state(), SessionState::Running);

    let err = session.attach(mock.addr()).await.unwrap_err();
    assert!(matches!(err, DebugError::InvalidState { .. }));
}

#[tokio::test]
async fn accepts_a_debuggee_that_connects_in() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let session = DebugSession::default();
    let mut events = session.subscribe();

    let (attached, mock) = tokio::join!(
        session.attach_listener(&listener),
        MockDebuggee::connect(
            addr,
            MockDebuggeeConfig {
                pause_on_connect: true,
                ..MockDebuggeeConfig::default()
            }
        )
    );
    attached.unwrap();
    let _mock = mock.unwrap();

    wait_for_state(&session, &mut events, SessionState::Paused).await;
    assert_eq!(
        session.snapshot().location,
        Some(PauseLocation::new("main.lua", 1))
    );
}

#[tokio::test]
async fn output_and_stray_errors_are_published() {
    let (mock, session, mut events) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    session
        .set_output(OutputStream::Stdout, OutputMode::Redirect)
        .await
        .unwrap();
    assert_eq!(mock.received().last().map(String::as_str), Some("OUTPUT stdout r"));

    mock.push_output("hello from the game\n");
    let text = next_matching(&mut events, |event| match event {
        SessionEvent::Output(text) => Some(text),
        _ => None,
    })
    .await;
    assert_eq!(text, "hello from the game\n");

    mock.push_error("runtime error in coroutine");
    let message = next_matching(&mut events, |event| match event {
        SessionEvent::DebuggeeError(message) => Some(message),
        _ => None,
    })
    .await;
    assert_eq!(message, "runtime error in coroutine");
    assert_eq!(session.state(), SessionState::Paused);
}

#[tokio::test]
async fn connection_loss_fails_pending_requests_and_terminates() {
    let (mock, session, mut events) = paused_session(
        MockDebuggeeConfig {
            silent: vec![CommandName::Exec],
            ..MockDebuggeeConfig::default()
        },
        SessionConfig::default(),
    )
    .await;

    // Queued synchronously, so both are outstanding when the debuggee hangs up.
    let (tx_a, rx_a) = oneshot::channel();
    let (tx_b, rx_b) = oneshot::channel();
    session.evaluate_with(0, "a", |_| {}, move |err| {
        let _ = tx_a.send(err);
    });
    session.evaluate_with(0, "b", |_| {}, move |err| {
        let _ = tx_b.send(err);
    });
    mock.disconnect();

    for pending in [rx_a, rx_b] {
        let err = pending.await.unwrap();
        assert_eq!(err.kind(), ErrorKind::Network, "{err}");
    }
    wait_for_state(&session, &mut events, SessionState::Terminated).await;
    assert!(session.evaluate(0, "a").await.is_err());
}

#[tokio::test]
async fn truncated_body_is_a_network_failure() {
    let (mock, session, mut events) = paused_session(
        MockDebuggeeConfig {
            silent: vec![CommandName::Stack],
            ..MockDebuggeeConfig::default()
        },
        SessionConfig::default(),
    )
    .await;

    let stack = tokio::spawn({
        let session = session.clone();
        async move { session.stack().await }
    });
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !mock.received().iter().any(|line| line.starts_with("STACK")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok());

    mock.push_raw(b"200 OK 100\n{{");
    mock.disconnect();

    let err = stack.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network, "{err}");
    wait_for_state(&session, &mut events, SessionState::Terminated).await;
}

#[tokio::test]
async fn silent_debuggee_times_out() {
    let (_mock, session, mut events) = paused_session(
        MockDebuggeeConfig {
            silent: vec![CommandName::Stack],
            ..MockDebuggeeConfig::default()
        },
        SessionConfig {
            reply_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        },
    )
    .await;

    let err = session.stack().await.unwrap_err();
    assert!(matches!(err, DebugError::Timeout));
    wait_for_state(&session, &mut events, SessionState::Terminated).await;
}

#[tokio::test]
async fn stack_is_decoded() {
    let (mock, session, _events) = paused_session(
        MockDebuggeeConfig {
            stack: r#"{{{"main", "@main.lua", 0, 42, "main", "", "main.lua"}, {score = {10, "10"}}, {}}}"#
                .to_string(),
            ..MockDebuggeeConfig::default()
        },
        SessionConfig::default(),
    )
    .await;

    let frames = session.stack().await.unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].current_line, 42);
    assert_eq!(frames[0].locals[0].name, "score");
    assert_eq!(frames[0].locals[0].display, "10");
    assert_eq!(mock.received(), vec!["STACK --{maxlevel=8}"]);
}

#[tokio::test]
async fn detach_is_final() {
    let (mock, session, mut events) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    session.detach().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(mock.received(), vec!["DONE"]);

    // The debuggee hanging up afterwards does not turn this into a termination.
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChanged(snapshot) = event {
            assert_ne!(snapshot.state, SessionState::Terminated);
        }
    }
    assert_eq!(session.state(), SessionState::Disconnected);

    assert!(session.run().await.is_err());
    assert!(session.set_breakpoint("main.lua", 1).await.is_err());
    assert!(session.attach(mock.addr()).await.is_err());
}

#[tokio::test]
async fn exit_terminates() {
    let (mock, session, _events) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    session.exit().await.unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(mock.received(), vec!["EXIT"]);
}

#[tokio::test]
async fn sessions_are_independent() {
    let (mock_a, session_a, _events_a) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;
    let (mock_b, session_b, _events_b) =
        paused_session(MockDebuggeeConfig::default(), SessionConfig::default()).await;

    session_a.set_breakpoint("a.lua", 1).await.unwrap();
    session_b.exit().await.unwrap();

    assert_eq!(session_a.state(), SessionState::Paused);
    assert_eq!(session_b.state(), SessionState::Terminated);
    assert_eq!(mock_a.received(), vec!["SETB a.lua 1"]);
    assert_eq!(mock_b.received(), vec!["EXIT"]);
}
