//! `/admin` statistics page

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use super::http::Request;
use super::stats::StreamStats;

/// Local clients see the page without credentials
pub fn is_authorized(request: &Request, peer: IpAddr, user: &str, password: Option<&str>) -> bool {
    if peer == IpAddr::V4(Ipv4Addr::LOCALHOST) {
        return true;
    }
    match (request.basic_credentials(), password) {
        (Some((u, p)), Some(password)) => u == user && p == password,
        _ => false,
    }
}

pub fn render(name: &str, stats: &StreamStats) -> String {
    let rows = [
        ("Mime type", stats.mime.clone().unwrap_or_else(|| "-".into())),
        ("Stream uptime", format_time(stats.uptime)),
        ("Stream bitrate", format!("{}/sec", format_bytes(stats.bitrate / 8.0))),
        ("Bytes processed", format_bytes(stats.total_bytes as f64)),
        ("Clients connected", stats.current_clients.to_string()),
        ("Maximum allowed clients", stats.max_clients.to_string()),
        (
            "Average simultaneous clients",
            (stats.average_clients as u64).to_string(),
        ),
        ("Peak client number", stats.peak_clients.to_string()),
        (
            "Peak time",
            stats.peak_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        (
            "Total client bitrate",
            format!("{}/sec", format_bytes(stats.consumption_bitrate / 8.0)),
        ),
        ("Total bytes sent", format_bytes(stats.consumption_bytes as f64)),
    ];

    let mut table = String::new();
    for (key, value) in rows {
        let _ = writeln!(table, "<tr><td>{}</td><td>{}</td></tr>", key, escape(&value));
    }
    format!(
        "<!doctype html public \"-//IETF//DTD HTML 2.0//EN\">\n<html>\n<head>\n  <title>Statistics for {}</title>\n</head>\n<body>\n<table>\n{}</table>\n</body>\n</html>\n",
        escape(name),
        table
    )
}

/// `1536.0` -> `"1.50 KB"`
pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 6] = ["", "K", "M", "G", "T", "P"];
    let mut value = bytes;
    let mut unit = 0;
    while unit < UNITS.len() - 1 && value >= 1024.0 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}B", value, UNITS[unit])
}

/// `90061s` -> `"1 days 01:01:01"`
pub fn format_time(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let mut parts = Vec::new();
    let mut days = secs / 86_400;
    if days >= 7 {
        parts.push(format!("{} weeks", days / 7));
        days %= 7;
    }
    if days >= 1 {
        parts.push(format!("{} days", days));
    }
    secs %= 86_400;
    parts.push(format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    ));
    parts.join(" ")
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_localhost_bypasses_password() {
        let request = Request::parse(b"GET /admin HTTP/1.0\r\n").unwrap();
        assert!(is_authorized(&request, "127.0.0.1".parse().unwrap(), "admin", None));
        assert!(!is_authorized(&request, "10.0.0.5".parse().unwrap(), "admin", Some("pw")));
    }

    #[test]
    fn test_basic_auth_against_password() {
        // admin:pw
        let request =
            Request::parse(b"GET /admin HTTP/1.0\r\nAuthorization: Basic YWRtaW46cHc=\r\n").unwrap();
        let peer = "10.0.0.5".parse().unwrap();
        assert!(is_authorized(&request, peer, "admin", Some("pw")));
        assert!(!is_authorized(&request, peer, "admin", Some("other")));
        assert!(!is_authorized(&request, peer, "admin", None));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_bytes(512.0), "512.00 B");
        assert_eq!(format_bytes(1536.0), "1.50 KB");
        assert_eq!(format_bytes(3.0 * 1024.0 * 1024.0 * 1024.0), "3.00 GB");
        assert_eq!(format_time(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_time(Duration::from_secs(90_061)), "1 days 01:01:01");
        assert_eq!(
            format_time(Duration::from_secs(8 * 86_400 + 3600)),
            "1 weeks 1 days 01:00:00"
        );
    }

    #[test]
    fn test_render_table() {
        let stats = StreamStats {
            mime: Some("application/ogg".into()),
            uptime: Duration::from_secs(61),
            bitrate: 8192.0,
            total_bytes: 2048,
            current_clients: 3,
            max_clients: 974,
            average_clients: 2.6,
            peak_clients: 4,
            peak_time: Utc::now(),
            consumption_bitrate: 0.0,
            consumption_bytes: 0,
        };
        let page = render("/default/http-audio", &stats);

        assert!(page.contains("<title>Statistics for /default/http-audio</title>"));
        assert!(page.contains("<tr><td>Mime type</td><td>application/ogg</td></tr>"));
        assert!(page.contains("<tr><td>Stream uptime</td><td>00:01:01</td></tr>"));
        assert!(page.contains("<tr><td>Stream bitrate</td><td>1.00 KB/sec</td></tr>"));
        assert!(page.contains("<tr><td>Average simultaneous clients</td><td>2</td></tr>"));
        assert!(page.contains("<tr><td>Maximum allowed clients</td><td>974</td></tr>"));
    }
}
