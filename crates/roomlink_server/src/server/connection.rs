#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use roomlink_domain::{ErrorKind, SessionId};
use roomlink_protocol::messages::{ClientFrame, ServerFrame};
use roomlink_protocol::version::PROTOCOL_VERSION;
use roomlink_protocol::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::{Principal, verify_hmac_token};
use crate::server::router::{EventRouter, RouterOutcome, SessionContext};
use crate::util::SecretString;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// What the control stream reader hands to the session.
enum Inbound {
	Frame(ClientFrame),
	/// A complete frame whose payload did not parse; the session carries on.
	Malformed(String),
	/// The stream cannot be read past this point.
	Broken(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	/// Without a secret every session is anonymous and any presented token is rejected.
	pub auth_hmac_secret: Option<SecretString>,
	pub outbox_capacity: usize,
	pub max_frame_size: usize,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			auth_hmac_secret: None,
			outbox_capacity: 512,
			max_frame_size: DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Serve one client connection: handshake, request loop, then teardown of everything the session owns.
pub async fn handle_connection(
	conn_id: u64,
	connection: quinn::Connection,
	router: Arc<EventRouter>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	let (control_send, mut control_recv) = connection
		.accept_bi()
		.await
		.context("accept control bidirectional stream")?;

	let max_frame_size = settings.max_frame_size;
	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Inbound>();
	let reader_task = tokio::spawn(async move {
		let mut buf = BytesMut::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("control stream read failed")),
			};
			buf.extend_from_slice(&tmp[..n]);

			loop {
				let inbound = match try_decode_frame_from_buffer::<ClientFrame>(&mut buf, max_frame_size) {
					Ok(Some(frame)) => Inbound::Frame(frame),
					Ok(None) => break,
					// The payload was consumed; the stream stays aligned on the next frame.
					Err(FramingError::Json(e)) => {
						metrics::counter!("roomlink_server_control_decode_errors_total").increment(1);
						debug!(conn_id, error = %e, "undecodable control frame");
						Inbound::Malformed(e.to_string())
					}
					Err(e) => {
						metrics::counter!("roomlink_server_control_decode_errors_total").increment(1);
						let _ = ctrl_tx.send(Inbound::Broken(e.to_string()));
						return Err(anyhow!(e).context("failed to decode control frame"));
					}
				};
				if ctrl_tx.send(inbound).is_err() {
					return Ok(());
				}
			}
		}
	});

	let (outbox_tx, outbox_rx) = mpsc::channel::<ServerFrame>(settings.outbox_capacity.max(1));
	let writer_task = tokio::spawn(run_writer(conn_id, control_send, outbox_rx, max_frame_size));

	let result = serve_session(conn_id, &router, &settings, &mut ctrl_rx, outbox_tx).await;

	// Every outbox sender is gone once the session is closed, so the writer drains and finishes.
	let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer_task).await;
	reader_task.abort();
	if let Ok(Err(e)) = reader_task.await {
		warn!(conn_id, error = %e, "control stream reader failed");
	}
	connection.close(0u32.into(), b"session closed");

	result
}

async fn serve_session(
	conn_id: u64,
	router: &EventRouter,
	settings: &ConnectionSettings,
	ctrl_rx: &mut mpsc::UnboundedReceiver<Inbound>,
	outbox: mpsc::Sender<ServerFrame>,
) -> anyhow::Result<()> {
	let (client_name, auth_token) = match tokio::time::timeout(HELLO_TIMEOUT, wait_for_hello(ctrl_rx)).await {
		Ok(Ok(hello)) => hello,
		Ok(Err(e)) => return Err(e),
		Err(_) => {
			send_error(&outbox, "HELLO_TIMEOUT", "no Hello received", String::new()).await;
			return Err(anyhow!("timed out waiting for Hello"));
		}
	};

	let principal = match authenticate(conn_id, settings, auth_token.as_deref()) {
		Ok(principal) => principal,
		Err(e) => {
			warn!(conn_id, error = %e, "auth token rejected");
			send_error(&outbox, "UNAUTHENTICATED", "invalid auth token", String::new()).await;
			return Ok(());
		}
	};

	let ctx = SessionContext {
		session_id: SessionId(conn_id),
		principal,
	};
	let principal_label = ctx.principal.as_ref().map(|p| p.email.to_string());
	info!(
		conn_id,
		session_id = %ctx.session_id,
		client_name = %client_name,
		principal = principal_label.as_deref().unwrap_or("<anonymous>"),
		"session opened"
	);

	if let Err(e) = router.open_session(&ctx, outbox.clone()).await {
		warn!(conn_id, error = %e, "session registration failed");
		send_error(&outbox, e.kind().as_code(), &e.to_string(), String::new()).await;
		return Ok(());
	}

	let loop_result = request_loop(&ctx, router, ctrl_rx, &outbox, principal_label).await;

	router.close_session(ctx.session_id).await;
	info!(conn_id, session_id = %ctx.session_id, "session closed");

	loop_result
}

async fn request_loop(
	ctx: &SessionContext,
	router: &EventRouter,
	ctrl_rx: &mut mpsc::UnboundedReceiver<Inbound>,
	outbox: &mpsc::Sender<ServerFrame>,
	principal: Option<String>,
) -> anyhow::Result<()> {
	outbox
		.send(ServerFrame::Welcome {
			version: PROTOCOL_VERSION,
			session_id: ctx.session_id,
			principal,
		})
		.await
		.map_err(|_| anyhow!("session outbox closed"))?;

	while let Some(inbound) = ctrl_rx.recv().await {
		let (request_id, action) = match inbound {
			Inbound::Frame(ClientFrame::Request { request_id, action }) => (request_id, action),
			Inbound::Frame(ClientFrame::Hello { .. }) => {
				debug!(session_id = %ctx.session_id, "ignoring repeated Hello");
				continue;
			}
			Inbound::Malformed(reason) => {
				info!(session_id = %ctx.session_id, reason = %reason, "rejecting malformed request");
				send_error(outbox, ErrorKind::InvalidRequest.as_code(), "malformed request", String::new()).await;
				continue;
			}
			Inbound::Broken(reason) => {
				warn!(session_id = %ctx.session_id, reason = %reason, "control stream unreadable; closing session");
				send_error(outbox, ErrorKind::MalformedPayload.as_code(), &reason, String::new()).await;
				return Ok(());
			}
		};

		match router.handle(ctx, action).await {
			RouterOutcome::Reply { status, body } => {
				let reply = ServerFrame::Reply {
					request_id,
					status,
					body,
				};
				if outbox.send(reply).await.is_err() {
					return Err(anyhow!("session outbox closed"));
				}
			}
			RouterOutcome::NoReply => {}
			RouterOutcome::Fatal { kind, message } => {
				send_error(outbox, kind.as_code(), &message, request_id).await;
				return Ok(());
			}
		}
	}

	Ok(())
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<Inbound>) -> anyhow::Result<(String, Option<String>)> {
	while let Some(inbound) = ctrl_rx.recv().await {
		let frame = match inbound {
			Inbound::Frame(frame) => frame,
			Inbound::Malformed(reason) => {
				debug!(reason = %reason, "skipping malformed frame before Hello");
				continue;
			}
			Inbound::Broken(reason) => return Err(anyhow!("control stream unreadable before Hello: {reason}")),
		};
		if let ClientFrame::Hello {
			version,
			client_name,
			auth_token,
		} = frame
		{
			if version != PROTOCOL_VERSION {
				warn!(version, "client speaks a different protocol version");
			}
			return Ok((client_name, auth_token.filter(|t| !t.trim().is_empty())));
		}
	}
	Err(anyhow!("connection closed before Hello"))
}

fn authenticate(conn_id: u64, settings: &ConnectionSettings, token: Option<&str>) -> anyhow::Result<Option<Principal>> {
	let Some(token) = token else {
		debug!(conn_id, "no auth token; anonymous session");
		return Ok(None);
	};
	let Some(secret) = settings.auth_hmac_secret.as_ref() else {
		return Err(anyhow!("token presented but no auth secret is configured"));
	};

	let claims = verify_hmac_token(token, secret.expose())?;
	Ok(Some(Principal::from_claims(claims)?))
}

async fn send_error(outbox: &mpsc::Sender<ServerFrame>, code: &str, message: &str, request_id: String) {
	let frame = ServerFrame::Error {
		code: code.to_string(),
		message: message.to_string(),
		request_id,
	};
	let _ = outbox.send(frame).await;
}

async fn run_writer(
	conn_id: u64,
	mut send: quinn::SendStream,
	mut outbox: mpsc::Receiver<ServerFrame>,
	max_frame_size: usize,
) {
	while let Some(frame) = outbox.recv().await {
		let bytes = match encode_frame(&frame, max_frame_size) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(conn_id, error = %e, "dropping unencodable frame");
				continue;
			}
		};
		if let Err(e) = send.write_all(&bytes).await {
			debug!(conn_id, error = %e, "control stream write failed");
			return;
		}
	}

	if send.finish().is_ok() {
		let _ = send.stopped().await;
	}
}
