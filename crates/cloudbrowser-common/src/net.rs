use std::net::IpAddr;

/// Replace the last octet of an IPv4 address (or the last hextet of an
/// IPv6 address) with a wildcard marker. The raw IP is retained only for
/// rate-limit/policy keys and must never be returned externally — this is
/// the one function allowed to produce the externally-visible form.
pub fn anonymize_ip(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let o = v4.octets();
            format!("{}.{}.{}.xxx", o[0], o[1], o[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let mut segments: Vec<String> = v6.segments().iter().map(|s| format!("{:x}", s)).collect();
            if let Some(last) = segments.last_mut() {
                *last = "xxxx".to_string();
            }
            segments.join(":")
        }
        Err(_) => "xxx.xxx.xxx.xxx".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_ipv4_last_octet() {
        assert_eq!(anonymize_ip("10.0.0.5"), "10.0.0.xxx");
    }

    #[test]
    fn masks_ipv6_last_hextet() {
        assert_eq!(
            anonymize_ip("2001:db8::1"),
            "2001:db8:0:0:0:0:0:xxxx"
        );
    }

    #[test]
    fn falls_back_on_garbage_input() {
        assert_eq!(anonymize_ip("not-an-ip"), "xxx.xxx.xxx.xxx");
    }
}
