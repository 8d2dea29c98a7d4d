use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;

use emostream_core::auth::token_verifier::AuthError;
use emostream_core::hub::stream_hub::StreamHub;
use emostream_core::protocol::event_sink::{ChannelSink, EventSink};
use emostream_core::protocol::inbound::ClientEvent;
use emostream_core::protocol::outbound::ServerEvent;
use emostream_core::session::stream_error::StreamError;

/// Headroom over the base64-expanded frame limit for the JSON envelope.
const LINE_OVERHEAD: usize = 64 * 1024;

/// Longest inbound line accepted for a given decoded payload limit.
pub fn max_line_bytes(max_payload_bytes: usize) -> usize {
    max_payload_bytes.div_ceil(3) * 4 + LINE_OVERHEAD
}

/// Accepts connections forever, one reader thread plus one writer thread
/// per client.
pub fn serve(listener: TcpListener, hub: Arc<StreamHub>) -> io::Result<()> {
    let max_line = max_line_bytes(hub.config().max_payload_bytes);
    log::info!("Listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Accept failed: {e}");
                continue;
            }
        };
        let hub = hub.clone();
        thread::spawn(move || {
            let peer = stream
                .peer_addr()
                .map_or_else(|_| "unknown peer".to_string(), |a| a.to_string());
            if let Err(e) = handle_connection(stream, &hub, max_line) {
                log::debug!("Connection {peer} ended with error: {e}");
            }
        });
    }
    Ok(())
}

enum Inbound {
    Event(ClientEvent),
    /// The line could not be used; the frame id is set when one was readable.
    Rejected(StreamError, Option<u64>),
    Closed,
}

fn handle_connection(stream: TcpStream, hub: &StreamHub, max_line: usize) -> io::Result<()> {
    let closer = stream.try_clone()?;
    let (sink, events) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink.with_close_hook(move || {
        let _ = closer.shutdown(Shutdown::Both);
    }));
    let writer = spawn_writer(stream.try_clone()?, events);
    let mut reader = BufReader::new(stream);

    let session_id = match read_event(&mut reader, max_line)? {
        Inbound::Event(ClientEvent::Connect(payload)) => {
            match hub.connect(payload.token.as_deref(), sink.clone()) {
                Ok(id) => Some(id),
                Err(err) => {
                    sink.emit(ServerEvent::error(&err, None));
                    None
                }
            }
        }
        Inbound::Event(other) => {
            let err = StreamError::from(AuthError::MissingToken);
            sink.emit(ServerEvent::error(&err, other.frame_id()));
            None
        }
        Inbound::Rejected(err, frame_id) => {
            sink.emit(ServerEvent::error(&err, frame_id));
            None
        }
        Inbound::Closed => None,
    };

    if let Some(id) = &session_id {
        read_loop(&mut reader, hub, id, &sink, max_line);
        hub.disconnect(id);
    }

    drop(sink);
    if writer.join().is_err() {
        log::error!("Connection writer panicked");
    }
    Ok(())
}

fn read_loop(
    reader: &mut BufReader<TcpStream>,
    hub: &StreamHub,
    session_id: &str,
    sink: &Arc<dyn EventSink>,
    max_line: usize,
) {
    loop {
        match read_event(reader, max_line) {
            Ok(Inbound::Event(event)) => {
                let last = matches!(event, ClientEvent::Disconnect);
                hub.handle(session_id, event);
                if last {
                    return;
                }
            }
            Ok(Inbound::Rejected(err, frame_id)) => {
                sink.emit(ServerEvent::error(&err, frame_id));
            }
            Ok(Inbound::Closed) => return,
            Err(e) => {
                log::debug!("Session {session_id}: read failed: {e}");
                return;
            }
        }
    }
}

/// Reads the next non-blank line and parses it as a client event.
///
/// An over-long line is skipped up to its newline so the next line parses
/// cleanly.
fn read_event(reader: &mut impl BufRead, max_line: usize) -> io::Result<Inbound> {
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .by_ref()
            .take(max_line as u64)
            .read_line(&mut line)?;
        if read == 0 {
            return Ok(Inbound::Closed);
        }
        if read >= max_line && !line.ends_with('\n') {
            discard_rest_of_line(reader)?;
            let err = StreamError::PayloadTooLarge(format!("Message exceeds {max_line} bytes"));
            return Ok(Inbound::Rejected(err, frame_id_hint(&line)));
        }
        if !line.trim().is_empty() {
            break;
        }
    }

    Ok(match serde_json::from_str::<ClientEvent>(line.trim()) {
        Ok(event) => Inbound::Event(event),
        Err(e) => Inbound::Rejected(
            StreamError::validation(format!("Malformed event: {e}")),
            frame_id_hint(&line),
        ),
    })
}

/// Consumes input up to and including the next newline, or to end of stream.
fn discard_rest_of_line(reader: &mut impl BufRead) -> io::Result<()> {
    loop {
        let (found, used) = {
            let buf = reader.fill_buf()?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (true, i + 1),
                None => (false, buf.len()),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}

/// Best-effort `"frame_id": N` lookup in a line that did not parse.
fn frame_id_hint(line: &str) -> Option<u64> {
    const KEY: &str = "\"frame_id\"";
    let rest = &line[line.find(KEY)? + KEY.len()..];
    let rest = rest.trim_start().strip_prefix(':')?.trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().ok()
}

/// Drains outbound events to the socket until every sender is gone or the
/// peer stops reading.
fn spawn_writer(stream: TcpStream, events: Receiver<ServerEvent>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut out = BufWriter::new(stream);
        for event in events.iter() {
            let line = match event.to_json() {
                Ok(line) => line,
                Err(e) => {
                    log::error!("Cannot encode {event:?}: {e}");
                    continue;
                }
            };
            let written = writeln!(out, "{line}").and_then(|_| {
                if events.is_empty() {
                    out.flush()
                } else {
                    Ok(())
                }
            });
            if let Err(e) = written {
                log::debug!("Write failed, dropping connection output: {e}");
                return;
            }
        }
        let _ = out.flush();
    })
}
