#![warn(clippy::pedantic)]
#![warn(clippy::all)]

use std::time::Duration;

use async_std::future::timeout;
use async_std::io::prelude::*;
use async_std::io::BufReader;
use async_std::net::TcpStream;
use serde_json::Value;

use crate::protocol::{IclError, IclResult, Reply, Request};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 25010;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// One JSON-framed connection to the ICL. Requests carry a sequential id and
/// the matching reply must echo it; exactly one request is in flight at a
/// time.
#[derive(Debug)]
pub struct IclLink {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    addr: String,
    next_id: u64,
    request_timeout: Duration,
}

impl IclLink {
    /// # Errors
    /// Returns ``IclError::Unreachable`` if the TCP connection cannot be
    /// established, which usually means the ICL is not running or not
    /// licensed on this machine.
    pub async fn connect(address: &str, port: u16) -> IclResult<Self> {
        let addr = format!("{address}:{port}");
        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| IclError::Unreachable {
                addr: addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(IclLink {
            reader: BufReader::new(stream.clone()),
            writer: stream,
            addr,
            next_id: 0,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }

    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
    }

    #[inline]
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.addr
    }

    /// Send one command and wait for its reply.
    /// # Errors
    /// Fails on i/o or timeout, on a reply whose id does not match, and on
    /// any error string reported by the service for this command.
    pub async fn request(&mut self, command: &str, parameters: Value) -> IclResult<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let mut line = serde_json::to_string(&Request::new(id, command, parameters))?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;

        let mut buf = String::new();
        let read = timeout(self.request_timeout, self.reader.read_line(&mut buf))
            .await
            .map_err(|_| IclError::Timeout {
                command: command.to_owned(),
                timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        if read == 0 {
            return Err(IclError::Closed);
        }
        let reply: Reply = serde_json::from_str(buf.trim_end())?;
        if reply.id != id {
            return Err(IclError::IdMismatch {
                want: id,
                got: reply.id,
            });
        }
        log::trace!("{} -> ok", reply.command);
        reply.into_results()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::io::prelude::*;
    use async_std::net::TcpListener;
    use async_std::task;
    use serde_json::json;

    #[test]
    fn a_reply_echoing_the_wrong_id_is_rejected() {
        task::block_on(async {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("loopback bind");
            let port = listener.local_addr().expect("local addr").port();
            let server = task::spawn(async move {
                let (stream, _) = listener.accept().await.expect("accept");
                let mut reader = BufReader::new(stream.clone());
                let mut line = String::new();
                reader.read_line(&mut line).await.expect("request line");
                let mut writer = stream;
                writer
                    .write_all(
                        b"{\"id\": 999, \"command\": \"icl_info\", \"results\": {}, \"errors\": []}\n",
                    )
                    .await
                    .expect("canned reply");
            });

            let mut link = IclLink::connect(DEFAULT_ADDRESS, port).await.expect("connect");
            let err = link
                .request("icl_info", json!({}))
                .await
                .expect_err("a stale id must not pass for the pending request");
            assert!(
                matches!(err, IclError::IdMismatch { want: 1, got: 999 }),
                "got {err:?}"
            );
            server.await;
        });
    }
}
