use modbus_client_tcp::{
    ErrorKind, ExceptionCode, ModbusClient, ModbusError, QuantityLimits, ResponseRead,
};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::Duration;

/// Reply for one request frame. `None` closes the connection without answering.
type Handler = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Accepts connections one after another and answers each request with
/// `handler`. Every received request frame is forwarded on the returned channel.
fn start_server(mut handler: Handler) -> (SocketAddr, Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            while let Some(request) = read_request(&mut stream) {
                let _ = tx.send(request.clone());
                match handler(&request) {
                    Some(response) => {
                        if stream.write_all(&response).is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    (addr, rx)
}

fn read_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).ok()?;
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut rest = vec![0u8; length];
    stream.read_exact(&mut rest).ok()?;

    let mut frame = header.to_vec();
    frame.extend(rest);
    Some(frame)
}

/// Wraps `pdu` in an MBAP header echoing the request's transaction and unit id.
fn reply(request: &[u8], pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&request[0..4]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(request[6]);
    frame.extend_from_slice(pdu);
    frame
}

/// Tiny register/coil store speaking the eight supported functions.
fn storage_handler() -> Handler {
    let mut coils = vec![false; 256];
    let mut registers = vec![0u16; 256];

    Box::new(move |request| {
        let function = request[7];
        let start = u16::from_be_bytes([request[8], request[9]]) as usize;
        let word = u16::from_be_bytes([request[10], request[11]]);

        let pdu = match function {
            0x01 | 0x02 => {
                let quantity = word as usize;
                let mut bytes = vec![0u8; quantity.div_ceil(8)];
                for i in 0..quantity {
                    if coils[start + i] {
                        bytes[i / 8] |= 1 << (i % 8);
                    }
                }
                let mut pdu = vec![function, bytes.len() as u8];
                pdu.extend(bytes);
                pdu
            }
            0x03 | 0x04 => {
                let quantity = word as usize;
                let mut pdu = vec![function, (quantity * 2) as u8];
                for value in &registers[start..start + quantity] {
                    pdu.extend_from_slice(&value.to_be_bytes());
                }
                pdu
            }
            0x05 => {
                coils[start] = word == 0xFF00;
                request[7..12].to_vec()
            }
            0x06 => {
                registers[start] = word;
                request[7..12].to_vec()
            }
            0x0F => {
                let data = &request[13..];
                for i in 0..word as usize {
                    coils[start + i] = data[i / 8] & (1 << (i % 8)) != 0;
                }
                request[7..12].to_vec()
            }
            0x10 => {
                let data = &request[13..];
                for i in 0..word as usize {
                    registers[start + i] = u16::from_be_bytes([data[2 * i], data[2 * i + 1]]);
                }
                request[7..12].to_vec()
            }
            other => vec![other | 0x80, 0x01],
        };

        Some(reply(request, &pdu))
    })
}

fn connected_client(addr: SocketAddr) -> ModbusClient {
    let mut client = ModbusClient::builder()
        .host(addr.ip().to_string())
        .port(addr.port())
        .response_timeout(Some(Duration::from_secs(2)))
        .build()
        .unwrap();
    client.connect().unwrap();
    assert!(client.is_connected());
    client
}

#[cfg(test)]
mod tcp_tests {
    use super::*;

    #[test]
    fn test_write_then_read_holding_registers() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        client.write_single_register(19, 111).unwrap();
        client.write_multiple_registers(20, &[0x1234, -2, 0x7FFF]).unwrap();

        let values = client.read_holding_registers(18, 5).unwrap();
        assert_eq!(values, vec![0, 111, 0x1234, -2, 0x7FFF]);
    }

    #[test]
    fn test_read_holding_registers_decodes_every_quantity() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        let written: Vec<i32> = (0..123).map(|i| i * 257 - 1000).collect();
        client.write_multiple_registers(0, &written).unwrap();
        client.write_single_register(123, 0x8001).unwrap();
        client.write_single_register(124, 42).unwrap();

        let mut expected = written.clone();
        expected.push(-32767);
        expected.push(42);

        for quantity in [1, 2, 7, 64, 124, 125] {
            let values = client.read_holding_registers(0, quantity).unwrap();
            assert_eq!(values, expected[..quantity as usize]);
        }
    }

    #[test]
    fn test_read_input_registers() {
        let (addr, requests) = start_server(Box::new(|request| {
            Some(reply(request, &[0x04, 0x04, 0x00, 0x2A, 0xFF, 0xFE]))
        }));
        let mut client = connected_client(addr);

        assert_eq!(client.read_input_registers(7, 2).unwrap(), vec![42, -2]);

        let request = requests.recv().unwrap();
        assert_eq!(request, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x00, 0x04, 0x00, 0x07, 0x00, 0x02]);
    }

    #[test]
    fn test_write_then_read_coils() {
        let (addr, requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        let values = [true, false, true, false, true, false, true, false, true];
        client.write_multiple_coils(0, &values).unwrap();

        let request = requests.recv().unwrap();
        // MBAP (7) + FC (1) + Addr (2) + Count (2) + ByteCount (1) + Data (2) = 15
        assert_eq!(request.len(), 15);
        assert_eq!(request[7], 0x0F);
        assert_eq!(request[12], 0x02);
        assert_eq!(request[13], 0x55);
        assert_eq!(request[14], 0x01);

        assert_eq!(client.read_coils(0, 9).unwrap(), values);
        assert_eq!(client.read_discrete_inputs(0, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_read_coils_bit_order() {
        let (addr, _requests) = start_server(Box::new(|request| {
            Some(reply(request, &[0x01, 0x01, 0x0A]))
        }));
        let mut client = connected_client(addr);

        assert_eq!(client.read_coils(0, 4).unwrap(), vec![false, true, false, true]);
    }

    #[test]
    fn test_single_coil_encoding() {
        let (addr, requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        client.write_single_coil(5, true).unwrap();
        client.write_single_coil(5, false).unwrap();

        let on = requests.recv().unwrap();
        let off = requests.recv().unwrap();
        assert_eq!(on[7..], [0x05, 0x00, 0x05, 0xFF, 0x00]);
        assert_eq!(off[7..], [0x05, 0x00, 0x05, 0x00, 0x00]);
    }

    #[test]
    fn test_exception_response() {
        let (addr, _requests) = start_server(Box::new(|request| {
            Some(reply(request, &[request[7] | 0x80, 0x02]))
        }));
        let mut client = connected_client(addr);

        let err = client.read_coils(0, 8).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception { function: 0x01, code: ExceptionCode::IllegalDataAddress }
        ));
        assert_eq!(err.kind(), ErrorKind::IllegalDataAddress);

        // The connection stays usable after a protocol-level rejection.
        assert!(client.is_connected());
        let err = client.write_single_register(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalDataAddress);
    }

    #[test]
    fn test_unknown_exception_code() {
        let (addr, _requests) = start_server(Box::new(|request| {
            Some(reply(request, &[request[7] | 0x80, 0x0B]))
        }));
        let mut client = connected_client(addr);

        let err = client.read_holding_registers(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unknown(0x0B));
    }

    #[test]
    fn test_invalid_arguments_fail_before_io() {
        let (addr, requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        let cases = [
            client.read_holding_registers(70000, 1).unwrap_err(),
            client.read_holding_registers(-1, 1).unwrap_err(),
            client.read_holding_registers(0, 126).unwrap_err(),
            client.read_coils(0, -3).unwrap_err(),
            client.read_coils(65535, 2).unwrap_err(),
            client.write_multiple_registers(0, &[0; 124]).unwrap_err(),
            client.write_single_coil(65536, true).unwrap_err(),
        ];
        for err in cases {
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{err}");
        }

        // Nothing reached the server.
        assert!(requests.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_uniform_limit() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = ModbusClient::builder()
            .host(addr.ip().to_string())
            .port(addr.port())
            .limits(QuantityLimits::uniform(125))
            .build()
            .unwrap();
        client.connect().unwrap();

        let err = client.write_multiple_coils(0, &[true; 126]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(client.write_multiple_coils(0, &[true; 125]).is_ok());
    }

    #[test]
    fn test_unit_identifier_is_sent_and_checked() {
        let (addr, requests) = start_server(Box::new(|request| {
            let mut frame = reply(request, &[0x06, 0x00, 0x00, 0x00, 0x01]);
            frame[6] = 0x02;
            Some(frame)
        }));
        let mut client = connected_client(addr);
        client.set_unit_identifier(1);

        let err = client.write_single_register(0, 1).unwrap_err();
        assert!(matches!(err, ModbusError::UnitIdMismatch { expected: 1, received: 2 }));
        assert_eq!(requests.recv().unwrap()[6], 0x01);
    }

    #[test]
    fn test_transaction_identifier_is_fixed() {
        let (addr, requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        client.read_holding_registers(0, 1).unwrap();
        client.read_holding_registers(0, 1).unwrap();

        assert_eq!(requests.recv().unwrap()[0..2], [0x00, 0x01]);
        assert_eq!(requests.recv().unwrap()[0..2], [0x00, 0x01]);
    }

    #[test]
    fn test_closed_stream_is_connection_failure() {
        let (addr, _requests) = start_server(Box::new(|_| None));
        let mut client = connected_client(addr);

        let err = client.read_holding_registers(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    }

    #[test]
    fn test_truncated_response_returns_nothing() {
        let (addr, _requests) = start_server(Box::new(|request| {
            // Byte count promises two registers, only one follows.
            Some(reply(request, &[0x03, 0x04, 0x12, 0x34]))
        }));
        let mut client = connected_client(addr);

        let err = client.read_holding_registers(0, 2).unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { expected: 13, actual: 11 }));
    }

    #[test]
    fn test_response_timeout() {
        let (addr, _requests) = start_server(Box::new(|_| {
            thread::sleep(Duration::from_millis(600));
            Some(Vec::new())
        }));
        let mut client = connected_client(addr);
        client.set_response_timeout(Some(Duration::from_millis(100))).unwrap();

        let err = client.read_holding_registers(0, 1).unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));
    }

    #[test]
    fn test_late_reply_is_not_taken_for_next_request() {
        let mut answered = 0;
        let (addr, _requests) = start_server(Box::new(move |request| {
            answered += 1;
            if answered == 1 {
                thread::sleep(Duration::from_millis(300));
                return Some(reply(request, &[0x03, 0x02, 0x11, 0x11]));
            }
            Some(reply(request, &[0x04, 0x02, 0x00, 0x07]))
        }));
        let mut client = connected_client(addr);
        client.set_response_timeout(Some(Duration::from_millis(100))).unwrap();

        let err = client.read_holding_registers(0, 1).unwrap_err();
        assert!(matches!(err, ModbusError::Timeout));
        assert!(!client.is_connected());

        let err = client.read_input_registers(0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);

        client.set_response_timeout(Some(Duration::from_secs(2))).unwrap();
        client.connect().unwrap();
        assert_eq!(client.read_input_registers(0, 1).unwrap(), vec![7]);
    }

    #[test]
    fn test_reply_to_other_function_is_rejected() {
        let (addr, _requests) = start_server(Box::new(|request| {
            Some(reply(request, &[0x03, 0x02, 0x11, 0x11]))
        }));
        let mut client = connected_client(addr);

        let err = client.read_input_registers(0, 1).unwrap_err();
        assert!(matches!(
            err,
            ModbusError::UnexpectedFunctionCode { expected: 0x04, received: 0x03 }
        ));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_byte_count_must_match_quantity() {
        let (addr, _requests) = start_server(Box::new(|request| {
            // Two registers requested, byte count and data describe one.
            Some(reply(request, &[0x03, 0x02, 0x00, 0x01, 0x00, 0x02]))
        }));
        let mut client = connected_client(addr);

        let err = client.read_holding_registers(0, 2).unwrap_err();
        assert!(matches!(err, ModbusError::ByteCountMismatch { expected: 4, received: 2 }));
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_framed_read_reassembles_segments() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let request = read_request(&mut stream).unwrap();
            let response = reply(&request, &[0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B]);

            stream.set_nodelay(true).unwrap();
            stream.write_all(&response[..5]).unwrap();
            thread::sleep(Duration::from_millis(100));
            stream.write_all(&response[5..]).unwrap();
        });

        let mut client = ModbusClient::builder()
            .host(addr.ip().to_string())
            .port(addr.port())
            .response_read(ResponseRead::Framed)
            .build()
            .unwrap();
        client.connect().unwrap();

        assert_eq!(client.read_holding_registers(0, 2).unwrap(), vec![10, 11]);
    }

    #[test]
    fn test_reconnect_replaces_connection() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = connected_client(addr);
        client.write_single_register(3, 33).unwrap();

        client.connect().unwrap();
        assert!(client.is_connected());
        assert_eq!(client.read_holding_registers(3, 1).unwrap(), vec![33]);
    }

    #[test]
    fn test_disconnect() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = connected_client(addr);

        client.disconnect();
        assert!(!client.is_connected());
        client.disconnect();

        let err = client.read_coils(0, 1).unwrap_err();
        assert!(matches!(err, ModbusError::ConnectionFailure(_)));
    }

    #[test]
    fn test_connect_to_overrides_host_and_port() {
        let (addr, _requests) = start_server(storage_handler());
        let mut client = ModbusClient::new();

        client.connect_to(addr.ip().to_string(), addr.port()).unwrap();
        assert!(client.is_connected());
        assert_eq!(client.hostname(), Some("127.0.0.1"));
        assert_eq!(client.port(), addr.port());
    }

    #[test]
    fn test_refused_connection_is_not_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = ModbusClient::with_host(addr.ip().to_string(), addr.port());
        client.set_connect_retries(5);

        let err = client.connect().unwrap_err();
        assert!(matches!(err, ModbusError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
        assert!(!client.is_connected());
    }
}
