//! 网络地址工具

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use crate::error::{Result, ServError};

/// 规范化监听地址
///
/// - `""` → `0.0.0.0:0`（随机端口）
/// - `":8080"` → `0.0.0.0:8080`
/// - `"host:port"` 保持不变
pub fn normalize_listen_addr(addr: &str) -> Result<String> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok("0.0.0.0:0".to_string());
    }

    let Some((host, port)) = addr.rsplit_once(':') else {
        return Err(ServError::InvalidArgument(format!(
            "listen addr {} missing port",
            addr
        )));
    };

    if !port.is_empty() && port.parse::<u16>().is_err() {
        return Err(ServError::InvalidArgument(format!(
            "listen addr {} has invalid port",
            addr
        )));
    }

    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let port = if port.is_empty() { "0" } else { port };
    Ok(format!("{}:{}", host, port))
}

/// 对外注册的地址
///
/// 绑定在未指定地址（0.0.0.0 / ::）上时，使用本机出口 IP 替换。
pub fn advertise_addr(bound: SocketAddr) -> String {
    if bound.ip().is_unspecified() {
        let ip = local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, bound.port()).to_string()
    } else {
        bound.to_string()
    }
}

/// 本机出口 IP
///
/// UDP connect 不会发送数据包，只用于让内核选择出口地址。
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr("").unwrap(), "0.0.0.0:0");
        assert_eq!(normalize_listen_addr(":8080").unwrap(), "0.0.0.0:8080");
        assert_eq!(normalize_listen_addr("127.0.0.1:").unwrap(), "127.0.0.1:0");
        assert_eq!(
            normalize_listen_addr("10.0.0.1:9000").unwrap(),
            "10.0.0.1:9000"
        );
    }

    #[test]
    fn test_normalize_listen_addr_errors() {
        assert!(normalize_listen_addr("localhost").is_err());
        assert!(normalize_listen_addr("127.0.0.1:http").is_err());
    }

    #[test]
    fn test_advertise_specified_addr() {
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        assert_eq!(advertise_addr(addr), "127.0.0.1:4567");
    }

    #[test]
    fn test_advertise_unspecified_addr_keeps_port() {
        let addr: SocketAddr = "0.0.0.0:4567".parse().unwrap();
        let advertised: SocketAddr = advertise_addr(addr).parse().unwrap();
        assert_eq!(advertised.port(), 4567);
        assert!(!advertised.ip().is_unspecified());
    }
}
