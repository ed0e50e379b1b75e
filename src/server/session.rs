use crate::connection::{ResultSet, TransactionStatus};
use crate::core::{ProxyError, Result};
use crate::parser::adapter::SqlParserAdapter;
use crate::parser::ast::Command;
use crate::protocol::messages::{
    BACKEND_PROCESS_ID, BACKEND_SECRET_KEY, admin_shutdown, local_error, server_parameters,
};
use crate::protocol::{BackendMessage, FrontendMessage, PgCodec};
use crate::router::{Execution, QueryRouter};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Secure-transport requests answered before the handshake is abandoned
pub const MAX_NEGOTIATION_REQUESTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    StartupReceived,
    Ready,
    Processing,
    Closed,
}

/// One client connection impersonating a PostgreSQL backend
///
/// The session answers the startup handshake itself, then reads one message
/// at a time, routes every statement it contains through the
/// [`QueryRouter`] and translates shard results back to protocol messages.
/// Local failures become error responses; only socket and protocol failures
/// end the session.
pub struct WireSession<S> {
    id: u64,
    peer: Option<SocketAddr>,
    framed: Framed<S, PgCodec>,
    router: Arc<QueryRouter>,
    parser: SqlParserAdapter,
    cancel: CancellationToken,
    state: SessionState,
    params: HashMap<String, String>,
    /// Set after an unsupported message until the next Sync
    skip_until_sync: bool,
    closed: bool,
}

impl<S> WireSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, router: Arc<QueryRouter>, cancel: CancellationToken) -> Self {
        Self {
            id: 0,
            peer: None,
            framed: Framed::new(stream, PgCodec::new()),
            router,
            parser: SqlParserAdapter::new(),
            cancel,
            state: SessionState::New,
            params: HashMap::new(),
            skip_until_sync: false,
            closed: false,
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Serve the connection until the client leaves, a socket or protocol
    /// error occurs, or the session token is cancelled
    ///
    /// The socket is always closed on return. Cancellation sends the
    /// administrator shutdown notice first.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.serve().await;
        if let Err(e) = &outcome {
            warn!(session_id = self.id, peer = ?self.peer, error = %e, "session failed");
        }
        let notify = self.cancel.is_cancelled();
        self.close(notify).await;
        outcome
    }

    async fn serve(&mut self) -> Result<()> {
        let cancel = self.cancel.clone();

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            started = self.handshake() => started?,
        };
        if !started {
            return Ok(());
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                message = self.receive() => message?,
            };
            let Some(message) = message else {
                debug!(session_id = self.id, "client disconnected");
                return Ok(());
            };

            let keep_going = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                outcome = self.process(message) => outcome?,
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    /// Answer the startup sequence
    ///
    /// Returns `false` when the client only wanted to cancel a query.
    async fn handshake(&mut self) -> Result<bool> {
        let mut negotiations = 0;

        loop {
            let message = self.receive().await?.ok_or_else(|| {
                ProxyError::Protocol("connection closed during startup".into())
            })?;

            match message {
                FrontendMessage::SslRequest | FrontendMessage::GssEncRequest => {
                    negotiations += 1;
                    if negotiations > MAX_NEGOTIATION_REQUESTS {
                        return Err(ProxyError::Protocol(
                            "too many secure transport negotiation requests".into(),
                        ));
                    }
                    self.write(BackendMessage::SslDeny).await?;
                    self.flush().await?;
                }
                FrontendMessage::CancelRequest { process_id, .. } => {
                    debug!(session_id = self.id, process_id, "ignoring cancel request");
                    return Ok(false);
                }
                FrontendMessage::Startup { params, .. } => {
                    self.params = params.into_iter().collect();
                    self.set_state(SessionState::StartupReceived);
                    self.greet().await?;
                    self.set_state(SessionState::Ready);
                    debug!(
                        session_id = self.id,
                        user = self.params.get("user").map(String::as_str).unwrap_or(""),
                        database = self.params.get("database").map(String::as_str).unwrap_or(""),
                        "session started"
                    );
                    return Ok(true);
                }
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )));
                }
            }
        }
    }

    async fn greet(&mut self) -> Result<()> {
        self.write(BackendMessage::AuthenticationOk).await?;

        let user = self.params.get("user").cloned().unwrap_or_default();
        for (name, value) in server_parameters(&user) {
            self.write(BackendMessage::parameter_status(name, value))
                .await?;
        }

        self.write(BackendMessage::BackendKeyData {
            process_id: BACKEND_PROCESS_ID,
            secret_key: BACKEND_SECRET_KEY,
        })
        .await?;
        self.ready().await
    }

    async fn receive(&mut self) -> Result<Option<FrontendMessage>> {
        match self.framed.next().await {
            Some(Ok(message)) => {
                trace!(session_id = self.id, ?message, "<-");
                Ok(Some(message))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Handle one frontend message; `false` ends the session
    async fn process(&mut self, message: FrontendMessage) -> Result<bool> {
        self.set_state(SessionState::Processing);

        match message {
            FrontendMessage::Terminate => {
                debug!(session_id = self.id, "client terminated session");
                return Ok(false);
            }
            FrontendMessage::Sync => {
                self.skip_until_sync = false;
                self.ready().await?;
            }
            _ if self.skip_until_sync => {
                trace!(session_id = self.id, "discarding message until sync");
            }
            FrontendMessage::Query(sql) => self.handle_query(&sql).await?,
            FrontendMessage::Other(tag) => {
                self.skip_until_sync = true;
                let err = local_error(format!(
                    "unsupported frontend message '{}'",
                    char::from(tag)
                ));
                self.write(BackendMessage::error(err)).await?;
                self.flush().await?;
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unexpected startup message after startup: {:?}",
                    other
                )));
            }
        }

        self.set_state(SessionState::Ready);
        Ok(true)
    }

    async fn handle_query(&mut self, sql: &str) -> Result<()> {
        if sql.trim().is_empty() {
            self.write(BackendMessage::EmptyQueryResponse).await?;
            return self.ready().await;
        }

        let statements = match self.parser.parse(sql) {
            Ok(statements) => statements,
            Err(e) => return self.send_error(e).await,
        };
        if statements.is_empty() {
            self.write(BackendMessage::EmptyQueryResponse).await?;
            return self.ready().await;
        }

        let router = Arc::clone(&self.router);
        let cancel = self.cancel.clone();
        for parsed in &statements {
            match router.execute(parsed, &cancel).await {
                Ok(execution) => self.send_result_sets(execution).await?,
                Err(e) => return self.send_error(e).await,
            }
        }
        self.ready().await
    }

    /// Translate the result sets of one statement
    async fn send_result_sets(&mut self, execution: Execution) -> Result<()> {
        let Execution { command, results } = execution;

        for ResultSet {
            fields,
            rows,
            rows_affected,
        } in results
        {
            if !fields.is_empty() {
                self.write(BackendMessage::RowDescription(fields)).await?;
            }
            for row in rows {
                self.write(BackendMessage::DataRow(row)).await?;
            }
            self.write(BackendMessage::CommandComplete(command_tag(
                command,
                rows_affected,
            )))
            .await?;
        }
        Ok(())
    }

    /// Report a failed statement and end the query cycle
    async fn send_error(&mut self, err: ProxyError) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }

        let fields = match err {
            ProxyError::Shard(fields) => {
                debug!(session_id = self.id, code = %fields.code, error = %fields.message, "shard error");
                *fields
            }
            other => {
                debug!(session_id = self.id, error = %other, "statement rejected");
                local_error(other.to_string())
            }
        };
        self.write(BackendMessage::error(fields)).await?;
        self.ready().await
    }

    async fn ready(&mut self) -> Result<()> {
        self.write(BackendMessage::ReadyForQuery(TransactionStatus::Idle))
            .await?;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<()> {
        SinkExt::<BackendMessage>::flush(&mut self.framed).await
    }

    async fn write(&mut self, message: BackendMessage) -> Result<()> {
        trace!(session_id = self.id, ?message, "->");
        self.framed.feed(message).await
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!(session_id = self.id, from = ?self.state, to = ?state, "session state");
            self.state = state;
        }
    }

    /// Close the client socket, announcing a shutdown first when `notify` is set
    ///
    /// Calling it again has no effect.
    pub async fn close(&mut self, notify: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.set_state(SessionState::Closed);

        if notify {
            if let Err(e) = self.write(BackendMessage::error(admin_shutdown())).await {
                debug!(session_id = self.id, error = %e, "failed to send shutdown notice");
            }
        }
        if let Err(e) = self.flush().await {
            debug!(session_id = self.id, error = %e, "failed to flush before close");
        }
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!(session_id = self.id, error = %e, "failed to shut down socket");
        }
        debug!(session_id = self.id, peer = ?self.peer, "session closed");
    }
}

fn command_tag(command: Command, rows: u64) -> String {
    match command {
        Command::Insert => format!("INSERT 0 {}", rows),
        other => format!("{} {}", other, rows),
    }
}
