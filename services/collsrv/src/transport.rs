//! Modbus TCP client over one physical connection

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{encode_adu, parse_read_response, MbapHeader, ModbusPdu, ReadRequest, MBAP_HEADER_LEN};
use crate::error::{CollectorError, Result};
use crate::model::Endpoint;

/// Responses carrying an older transaction id are skipped at most this many times
const MAX_STALE_FRAMES: usize = 3;

fn map_io(err: std::io::Error, what: &str) -> CollectorError {
    match err.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe => {
            CollectorError::connection(format!("{}: connection closed ({})", what, err))
        },
        _ => CollectorError::io(format!("{}: {}", what, err)),
    }
}

pub struct ModbusTcpClient {
    stream: TcpStream,
    endpoint: Endpoint,
    transaction_id: u16,
    request_timeout: Duration,
}

impl ModbusTcpClient {
    pub async fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let addr = endpoint.to_string();
        debug!("TCP connecting: {}", addr);

        let stream = match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CollectorError::connection(format!(
                    "Failed to connect to {}: {}",
                    addr, e
                )))
            },
            Err(_) => {
                return Err(CollectorError::timeout(format!(
                    "Connection to {} timed out",
                    addr
                )))
            },
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY on {}: {}", addr, e);
        }
        info!("TCP connected: {}", addr);

        Ok(Self {
            stream,
            endpoint: endpoint.clone(),
            transaction_id: 0,
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    /// Execute one read request against `unit_id`
    pub async fn read(&mut self, unit_id: u8, request: &ReadRequest) -> Result<Vec<u16>> {
        let transaction_id = self.next_transaction_id();
        let frame = encode_adu(transaction_id, unit_id, &request.to_pdu()?);

        match timeout(self.request_timeout, self.stream.write_all(&frame)).await {
            Ok(Ok(())) => {},
            Ok(Err(e)) => return Err(map_io(e, "TCP send")),
            Err(_) => return Err(CollectorError::timeout("TCP send timed out")),
        }

        for _ in 0..=MAX_STALE_FRAMES {
            let (header, unit, pdu) = self.receive_frame().await?;
            if header.transaction_id != transaction_id {
                warn!(
                    "{}: skipping stale response tid={} (expected {})",
                    self.endpoint, header.transaction_id, transaction_id
                );
                continue;
            }
            if unit != unit_id {
                return Err(CollectorError::protocol(format!(
                    "Unit id mismatch: expected {}, got {}",
                    unit_id, unit
                )));
            }
            return parse_read_response(&pdu, request);
        }

        Err(CollectorError::protocol(format!(
            "No response for transaction {}",
            transaction_id
        )))
    }

    async fn receive_frame(&mut self) -> Result<(MbapHeader, u8, ModbusPdu)> {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match timeout(self.request_timeout, self.stream.read_exact(&mut header)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(map_io(e, "TCP header read")),
            Err(_) => return Err(CollectorError::timeout("TCP header read timed out")),
        }
        let header = MbapHeader::parse(&header)?;

        let mut body = vec![0u8; header.length];
        match timeout(self.request_timeout, self.stream.read_exact(&mut body)).await {
            Ok(Ok(_)) => {},
            Ok(Err(e)) => return Err(map_io(e, "TCP PDU read")),
            Err(_) => return Err(CollectorError::timeout("TCP PDU read timed out")),
        }

        debug!("TCP RX: {}B", MBAP_HEADER_LEN + body.len());
        let pdu = ModbusPdu::from_slice(&body[1..])?;
        Ok((header, body[0], pdu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FunctionCode;
    use tokio::net::TcpListener;

    /// Serve exactly one FC03 request with the given words
    async fn serve_once(listener: TcpListener, words: Vec<u16>) {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 12];
        socket.read_exact(&mut request).await.unwrap();

        let mut response = Vec::new();
        response.extend_from_slice(&request[0..4]);
        let length = 3 + words.len() * 2;
        response.extend_from_slice(&(length as u16).to_be_bytes());
        response.push(request[6]);
        response.push(0x03);
        response.push((words.len() * 2) as u8);
        for word in words {
            response.extend_from_slice(&word.to_be_bytes());
        }
        socket.write_all(&response).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_holding_registers_roundtrip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(serve_once(listener, vec![0x4148, 0x0000]));

        let endpoint = Endpoint::new("127.0.0.1", port);
        let mut client =
            ModbusTcpClient::connect(&endpoint, Duration::from_secs(1), Duration::from_secs(1))
                .await
                .unwrap();
        let request = ReadRequest::new(FunctionCode::ReadHoldingRegisters, 100, 2).unwrap();
        let words = client.read(7, &request).await.unwrap();

        assert_eq!(words, vec![0x4148, 0x0000]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_link_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let endpoint = Endpoint::new("127.0.0.1", port);
        let err = ModbusTcpClient::connect(&endpoint, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_link_error());
    }

    #[tokio::test]
    async fn test_peer_close_is_link_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let endpoint = Endpoint::new("127.0.0.1", port);
        let mut client =
            ModbusTcpClient::connect(&endpoint, Duration::from_secs(1), Duration::from_secs(1))
                .await
                .unwrap();
        server.await.unwrap();

        let request = ReadRequest::new(FunctionCode::ReadHoldingRegisters, 0, 1).unwrap();
        let err = client.read(1, &request).await.unwrap_err();
        assert!(err.is_link_error(), "{}", err);
    }
}
