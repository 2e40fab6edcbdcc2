use shared::types::{Observation, PortObservation, Protocol};

const HOST_BANNER: &str = "Nmap scan report for ";

/// Parse an nmap text report into per-host observations.
///
/// A banner line starts a new host; port lines (`22/tcp open ssh ...`) attach
/// to the most recent host. Anything else, including port lines that appear
/// before the first banner, is ignored.
pub fn parse_report(output: &str) -> Vec<Observation> {
    let mut hosts = Vec::new();
    let mut current: Option<Observation> = None;

    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(HOST_BANNER) {
            if let Some(host) = current.take() {
                hosts.push(host);
            }
            let (address, hostname) = split_host_line(rest);
            if address.is_empty() {
                continue;
            }
            current = Some(Observation {
                address,
                hostname,
                ports: Vec::new(),
            });
        } else if let Some(host) = current.as_mut() {
            if let Some(port) = parse_port_line(line) {
                host.ports.push(port);
            }
        }
    }

    if let Some(host) = current {
        hosts.push(host);
    }

    hosts
}

/// Split the text after the banner into address and resolved name:
/// `router.lan (192.168.0.1)` -> (`192.168.0.1`, `router.lan`),
/// `10.0.0.1 [host down]` -> `10.0.0.1`, `[fe80::1]` -> `fe80::1`.
pub fn split_host_line(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    let (address, hostname) = match (raw.find('('), raw.find(')')) {
        (Some(open), Some(close)) if open < close => {
            let name = raw[..open].trim();
            (&raw[open + 1..close], Some(name).filter(|n| !n.is_empty()))
        }
        _ => (raw, None),
    };

    let address = address
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    (address, hostname.map(str::to_string))
}

fn parse_port_line(line: &str) -> Option<PortObservation> {
    let mut parts = line.split_whitespace();

    let (port, protocol) = parts.next()?.split_once('/')?;
    let port: u16 = port.parse().ok().filter(|p| *p != 0)?;
    let protocol = Protocol::parse(protocol)?;

    let state = parts.next()?;
    if state != "open" {
        return None;
    }

    let service_hint = parts.next().unwrap_or_default().to_string();
    let rest: Vec<&str> = parts.collect();
    let version = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };

    Some(PortObservation {
        port,
        protocol,
        state: state.to_string(),
        service_hint,
        version,
    })
}
