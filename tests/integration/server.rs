//! In-process server stand-in speaking just enough of the wire protocol to
//! drive the client end to end over real sockets.
//!
//! Behavior is keyed off markers in the query text:
//! - containing `SLEEP`: the reply is withheld until a `KILL QUERY` for
//!   this connection arrives, then ERR 1317 (query interrupted)
//! - containing `boom`: ERR 1064
//! - containing `delay`: 20ms pause, then OK
//! - containing `die`: the connection is dropped without a reply
//! - `KILL QUERY <id>`: wakes the blocked connection `<id>`, replies OK

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

pub const SERVER_VERSION: &str = "8.0.0-fake";

const CLIENT_LONG_PASSWORD: u32 = 1;
const CLIENT_FOUND_ROWS: u32 = 1 << 1;
const CLIENT_LONG_FLAG: u32 = 1 << 2;
const CLIENT_PROTOCOL_41: u32 = 1 << 9;
const CLIENT_TRANSACTIONS: u32 = 1 << 14;
const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;

const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
    | CLIENT_FOUND_ROWS
    | CLIENT_LONG_FLAG
    | CLIENT_PROTOCOL_41
    | CLIENT_TRANSACTIONS
    | CLIENT_SECURE_CONNECTION
    | CLIENT_MULTI_RESULTS
    | CLIENT_PLUGIN_AUTH
    | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;

#[derive(Default)]
struct ServerState {
    next_connection_id: AtomicU32,
    connections_accepted: AtomicUsize,
    prepares: AtomicUsize,
    kills: AtomicUsize,
    next_statement_id: AtomicU32,
    /// Connection id -> wakeup for its blocked query.
    blocked: Mutex<HashMap<u32, Arc<Notify>>>,
}

pub struct FakeServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

/// Install the test log subscriber once; `RUST_LOG` controls verbosity.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl FakeServer {
    pub async fn start() -> FakeServer {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let state: Arc<ServerState> = Arc::default();

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accept_state.connections_accepted.fetch_add(1, Ordering::SeqCst);
                let conn_state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    let _ = serve_connection(stream, conn_state).await;
                });
            }
        });

        FakeServer { addr, state }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.connections_accepted.load(Ordering::SeqCst)
    }

    pub fn prepare_count(&self) -> usize {
        self.state.prepares.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<ServerState>) -> std::io::Result<()> {
    let connection_id = state.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
    let wakeup = Arc::new(Notify::new());
    state
        .blocked
        .lock()
        .unwrap()
        .insert(connection_id, Arc::clone(&wakeup));

    let result = drive(&mut stream, &state, connection_id, &wakeup).await;
    state.blocked.lock().unwrap().remove(&connection_id);
    result
}

async fn drive(
    stream: &mut TcpStream,
    state: &ServerState,
    connection_id: u32,
    wakeup: &Notify,
) -> std::io::Result<()> {
    write_packet(stream, 0, &greeting_payload(connection_id)).await?;

    // Handshake response; any credentials are accepted.
    let (seq, _response) = read_packet(stream).await?;
    write_packet(stream, seq.wrapping_add(1), &ok_payload()).await?;

    loop {
        let (seq, request) = read_packet(stream).await?;
        let reply_seq = seq.wrapping_add(1);
        let Some(&command) = request.first() else {
            return Ok(());
        };

        match command {
            // COM_QUIT
            0x01 => return Ok(()),
            // COM_PING
            0x0e => write_packet(stream, reply_seq, &ok_payload()).await?,
            // COM_RESET_CONNECTION
            0x1f => write_packet(stream, reply_seq, &ok_payload()).await?,
            // COM_STMT_CLOSE: no reply
            0x19 => continue,
            // COM_INIT_DB: databases named "missing*" do not exist
            0x02 => {
                let db = String::from_utf8_lossy(&request[1..]).to_string();
                if db.starts_with("missing") {
                    write_packet(
                        stream,
                        reply_seq,
                        &err_payload(1049, "42000", "Unknown database"),
                    )
                    .await?;
                } else {
                    write_packet(stream, reply_seq, &ok_payload()).await?;
                }
            }
            // COM_STMT_PREPARE
            0x16 => {
                state.prepares.fetch_add(1, Ordering::SeqCst);
                let text = String::from_utf8_lossy(&request[1..]).to_string();
                let statement_id = state.next_statement_id.fetch_add(1, Ordering::SeqCst) + 1;
                let num_params = text.matches('?').count() as u16;
                let num_columns = u16::from(text.trim_start().to_uppercase().starts_with("SELECT"));

                let mut seq = reply_seq;
                write_packet(stream, seq, &prepare_ok_payload(statement_id, num_columns, num_params))
                    .await?;
                seq = seq.wrapping_add(1);
                seq = write_definitions(stream, seq, num_params).await?;
                write_definitions(stream, seq, num_columns).await?;
            }
            // COM_QUERY
            0x03 => {
                let text = String::from_utf8_lossy(&request[1..]).to_string();

                if let Some(target) = text.strip_prefix("KILL QUERY ") {
                    state.kills.fetch_add(1, Ordering::SeqCst);
                    if let Ok(id) = target.trim().parse::<u32>() {
                        if let Some(notify) = state.blocked.lock().unwrap().get(&id) {
                            notify.notify_one();
                        }
                    }
                    write_packet(stream, reply_seq, &ok_payload()).await?;
                } else if text.contains("SLEEP") {
                    wakeup.notified().await;
                    write_packet(
                        stream,
                        reply_seq,
                        &err_payload(1317, "70100", "Query execution was interrupted"),
                    )
                    .await?;
                } else if text.contains("boom") {
                    write_packet(
                        stream,
                        reply_seq,
                        &err_payload(1064, "42000", "You have an error in your SQL syntax"),
                    )
                    .await?;
                } else if text.contains("die") {
                    return Ok(());
                } else if text.contains("delay") {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    write_packet(stream, reply_seq, &ok_payload()).await?;
                } else {
                    write_packet(stream, reply_seq, &ok_payload()).await?;
                }
            }
            _ => {
                write_packet(stream, reply_seq, &err_payload(1047, "08S01", "Unknown command"))
                    .await?
            }
        }
    }
}

async fn write_definitions(
    stream: &mut TcpStream,
    mut seq: u8,
    count: u16,
) -> std::io::Result<u8> {
    if count == 0 {
        return Ok(seq);
    }
    for _ in 0..count {
        write_packet(stream, seq, b"\x03def").await?;
        seq = seq.wrapping_add(1);
    }
    write_packet(stream, seq, &eof_payload()).await?;
    Ok(seq.wrapping_add(1))
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = header[0] as usize | (header[1] as usize) << 8 | (header[2] as usize) << 16;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((header[3], payload))
}

async fn write_packet(stream: &mut TcpStream, seq: u8, payload: &[u8]) -> std::io::Result<()> {
    let len = payload.len();
    let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    stream.flush().await
}

fn greeting_payload(connection_id: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.push(10); // protocol version
    p.extend_from_slice(SERVER_VERSION.as_bytes());
    p.push(0);
    p.extend_from_slice(&connection_id.to_le_bytes());
    p.extend_from_slice(b"abcdefgh"); // scramble part 1
    p.push(0); // filler
    p.extend_from_slice(&(SERVER_CAPABILITIES as u16).to_le_bytes());
    p.push(0x21); // charset
    p.extend_from_slice(&2u16.to_le_bytes()); // status: autocommit
    p.extend_from_slice(&((SERVER_CAPABILITIES >> 16) as u16).to_le_bytes());
    p.push(21); // auth data length
    p.extend_from_slice(&[0u8; 10]); // reserved
    p.extend_from_slice(b"ijklmnopqrst"); // scramble part 2
    p.push(0);
    p.extend_from_slice(b"mysql_native_password");
    p.push(0);
    p
}

fn ok_payload() -> Vec<u8> {
    // header, affected rows, last insert id, status, warnings
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

fn eof_payload() -> Vec<u8> {
    vec![0xFE, 0x00, 0x00, 0x02, 0x00]
}

fn err_payload(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut p = vec![0xFF];
    p.extend_from_slice(&code.to_le_bytes());
    p.push(b'#');
    p.extend_from_slice(sql_state.as_bytes());
    p.extend_from_slice(message.as_bytes());
    p
}

fn prepare_ok_payload(statement_id: u32, num_columns: u16, num_params: u16) -> Vec<u8> {
    let mut p = vec![0x00];
    p.extend_from_slice(&statement_id.to_le_bytes());
    p.extend_from_slice(&num_columns.to_le_bytes());
    p.extend_from_slice(&num_params.to_le_bytes());
    p.push(0x00); // filler
    p.extend_from_slice(&0u16.to_le_bytes()); // warnings
    p
}
