use crate::address::AddressSpec;
use crate::error::{Result, Socks5Error};
use crate::protocol::{Command, RSV, ReplyCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Request is a parsed client command and its target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: AddressSpec,
}

/// read_request parses the client's command request.
///
/// The address is always consumed before the command is validated so an
/// unsupported command can still be answered cleanly.
pub async fn read_request<S>(stream: &mut S) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    // SOCKS5 request format
    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reqbuf = [0u8; 3];
    stream.read_exact(&mut reqbuf).await?;

    let [version, command, reserved] = reqbuf;

    if version != Version::SOCKS5 as u8 {
        return Err(Socks5Error::protocol(format!(
            "unsupported SOCKS version {version:#04x} in request"
        )));
    }

    if reserved != RSV {
        return Err(Socks5Error::protocol(format!(
            "reserved byte must be zero, got {reserved:#04x}"
        )));
    }

    let target = AddressSpec::read_from(stream).await.map_err(|e| match e {
        Socks5Error::MalformedAddress(msg) => Socks5Error::ProtocolViolation(msg),
        other => other,
    })?;

    let command = Command::from_byte(command).ok_or(Socks5Error::CommandNotSupported(command))?;

    Ok(Request { command, target })
}

/// encode_reply builds a server reply frame
pub fn encode_reply(reply_code: ReplyCode, bound_addr: &AddressSpec) -> Vec<u8> {
    // SOCKS5 reply format
    // +----+-----+-------+------+----------+----------+
    // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    let mut reply = vec![Version::SOCKS5 as u8, reply_code as u8, RSV];
    bound_addr.encode_into(&mut reply);
    reply
}

/// send_reply writes one reply frame to the client
pub async fn send_reply<W>(stream: &mut W, reply_code: ReplyCode, bound_addr: &AddressSpec) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(reply_code, bound_addr)).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AddressType;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_read_connect_ipv4() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50];
        let request = read_request(&mut &bytes[..]).await.unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(
            request.target,
            AddressSpec::Ipv4(Ipv4Addr::new(93, 184, 216, 34), 80)
        );
    }

    #[tokio::test]
    async fn test_read_udp_associate_domain() {
        let mut bytes = vec![0x05, 0x03, 0x00];
        bytes.extend(AddressSpec::DomainName("dns.example".into(), 53).encode());
        let request = read_request(&mut &bytes[..]).await.unwrap();
        assert_eq!(request.command, Command::UdpAssociate);
        assert_eq!(request.target.address_type(), AddressType::DomainName);
    }

    #[tokio::test]
    async fn test_nonzero_reserved_byte() {
        for rsv in [0x01u8, 0x7F, 0xFF] {
            let bytes = [0x05, 0x01, rsv, 0x01, 127, 0, 0, 1, 0, 80];
            let err = read_request(&mut &bytes[..]).await.unwrap_err();
            assert!(matches!(err, Socks5Error::ProtocolViolation(_)));
            assert_eq!(err.reply_code(), None);
        }
    }

    #[tokio::test]
    async fn test_wrong_version() {
        let bytes = [0x04, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        let err = read_request(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, Socks5Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let bytes = [0x05, 0x09, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        let err = read_request(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, Socks5Error::CommandNotSupported(0x09)));
        assert_eq!(err.reply_code(), Some(ReplyCode::CommandNotSupported));
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let bytes = [0x05, 0x01, 0x00, 0x02, 127, 0, 0, 1, 0, 80];
        let err = read_request(&mut &bytes[..]).await.unwrap_err();
        assert_eq!(err.reply_code(), Some(ReplyCode::AddrTypeUnsupported));
    }

    #[tokio::test]
    async fn test_truncated_request() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 127, 0];
        let err = read_request(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, Socks5Error::Io(_)));
    }

    #[test]
    fn test_encode_reply() {
        let bound = AddressSpec::Ipv4(Ipv4Addr::new(10, 0, 0, 2), 40000);
        assert_eq!(
            encode_reply(ReplyCode::Succeeded, &bound),
            vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x9C, 0x40]
        );
        assert_eq!(
            encode_reply(ReplyCode::HostUnreachable, &AddressSpec::unspecified()),
            vec![0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }
}
