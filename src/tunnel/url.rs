//! Tunnel instance URL parsing.
//!
//! Agents describe a tunnel with a command line of the form
//! `<mode>://<host>[:<port>][/<target>[:<port>]][?k=v&...]`. Parsing never
//! fails: malformed input simply yields empty fields.

/// Structured form of a tunnel command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTunnelUrl {
    pub tunnel_address: String,
    pub tunnel_port: String,
    pub target_address: String,
    pub target_port: String,
    pub tls_mode: String,
    pub log_level: String,
    pub cert_path: String,
    pub key_path: String,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Default for ParsedTunnelUrl {
    fn default() -> Self {
        Self {
            tunnel_address: String::new(),
            tunnel_port: String::new(),
            target_address: String::new(),
            target_port: String::new(),
            tls_mode: "inherit".to_string(),
            log_level: "inherit".to_string(),
            cert_path: String::new(),
            key_path: String::new(),
            min: None,
            max: None,
        }
    }
}

/// Parse a tunnel command line. `mode` is the instance type ("server" or
/// "client"); the `tls` query key is only meaningful in server mode.
pub fn parse_instance_url(raw: &str, mode: &str) -> ParsedTunnelUrl {
    let mut parsed = ParsedTunnelUrl::default();

    if raw.is_empty() {
        return parsed;
    }

    // Strip the scheme prefix.
    let mut rest = match raw.find("://") {
        Some(idx) => &raw[idx + 3..],
        None => raw,
    };

    // Split off the query string.
    let query = match rest.find('?') {
        Some(idx) => {
            let q = &rest[idx + 1..];
            rest = &rest[..idx];
            q
        }
        None => "",
    };

    // Split host from the target path on the first slash.
    let (host_part, path_part) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => (rest, ""),
    };

    let (addr, port) = split_addr_port(host_part);
    parsed.tunnel_address = addr;
    parsed.tunnel_port = port;

    let (addr, port) = split_addr_port(path_part);
    parsed.target_address = addr;
    parsed.target_port = port;

    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "tls" => {
                if mode == "server" {
                    match value {
                        "0" => parsed.tls_mode = "mode0".to_string(),
                        "1" => parsed.tls_mode = "mode1".to_string(),
                        "2" => parsed.tls_mode = "mode2".to_string(),
                        _ => {}
                    }
                }
            }
            "log" => parsed.log_level = value.to_lowercase(),
            "crt" => parsed.cert_path = value.to_string(),
            "key" => parsed.key_path = value.to_string(),
            "min" => parsed.min = value.parse().ok(),
            "max" => parsed.max = value.parse().ok(),
            _ => {}
        }
    }

    parsed
}

/// Split "addr:port" into its parts. A bare integer is a port; anything else
/// is an address.
fn split_addr_port(part: &str) -> (String, String) {
    if part.is_empty() {
        return (String::new(), String::new());
    }
    if let Some((addr, port)) = part.split_once(':') {
        (addr.to_string(), port.to_string())
    } else if part.parse::<u32>().is_ok() {
        (String::new(), part.to_string())
    } else {
        (part.to_string(), String::new())
    }
}

/// Reassemble a command line from a parsed configuration. The inverse of
/// [`parse_instance_url`] modulo query parameter order.
pub fn build_command_line(mode: &str, cfg: &ParsedTunnelUrl) -> String {
    let mut out = format!("{}://{}", mode, join_addr_port(&cfg.tunnel_address, &cfg.tunnel_port));

    let target = join_addr_port(&cfg.target_address, &cfg.target_port);
    if !target.is_empty() {
        out.push('/');
        out.push_str(&target);
    }

    let mut params: Vec<String> = Vec::new();
    if mode == "server" {
        match cfg.tls_mode.as_str() {
            "mode0" => params.push("tls=0".to_string()),
            "mode1" => params.push("tls=1".to_string()),
            "mode2" => params.push("tls=2".to_string()),
            _ => {}
        }
    }
    if !cfg.log_level.is_empty() && cfg.log_level != "inherit" {
        params.push(format!("log={}", cfg.log_level));
    }
    if !cfg.cert_path.is_empty() {
        params.push(format!("crt={}", cfg.cert_path));
    }
    if !cfg.key_path.is_empty() {
        params.push(format!("key={}", cfg.key_path));
    }
    if let Some(min) = cfg.min {
        params.push(format!("min={}", min));
    }
    if let Some(max) = cfg.max {
        params.push(format!("max={}", max));
    }

    if !params.is_empty() {
        out.push('?');
        out.push_str(&params.join("&"));
    }

    out
}

fn join_addr_port(addr: &str, port: &str) -> String {
    if port.is_empty() {
        addr.to_string()
    } else if addr.is_empty() {
        format!(":{}", port)
    } else {
        format!("{}:{}", addr, port)
    }
}
