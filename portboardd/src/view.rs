//! Read path: the last published snapshot with user overrides applied.
//! Pure; runs alongside a discovery cycle without coordinating with it.

use std::collections::BTreeMap;
use shared::protocol::{FIELD_FAVORITE, FIELD_HIDDEN, FIELD_ICON, FIELD_NAME};
use shared::types::{
    EnrichedService, HostSnapshot, HostView, OverlayConfig, OverlayFields, OverlayHost,
    OverlayValue, ServiceView, Snapshot,
};

fn extra_fields(fields: &BTreeMap<String, OverlayValue>) -> BTreeMap<String, OverlayValue> {
    fields
        .iter()
        .filter(|(key, _)| ![FIELD_NAME, FIELD_FAVORITE, FIELD_HIDDEN, FIELD_ICON].contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn present_service(service: &EnrichedService, overlay: &OverlayHost) -> Option<ServiceView> {
    let stored = overlay.service(service.port())?;

    Some(ServiceView {
        port: service.port(),
        protocol: service.observed.protocol,
        service_hint: service.observed.service_hint.clone(),
        name: stored.name().map(str::to_string).unwrap_or_else(|| service.display_name.clone()),
        icon: stored.icon().map(str::to_string).or_else(|| service.icon.clone()),
        favorite: stored.favorite().unwrap_or(false),
        hidden: stored.hidden().unwrap_or(false),
        first_seen: stored.first_seen,
        last_seen: stored.last_seen,
        extra: extra_fields(&stored.fields),
    })
}

fn present_host(host: &HostSnapshot, overlay: &OverlayConfig) -> Option<HostView> {
    let stored = overlay.host(&host.address);

    let services = match stored {
        Some(stored) => host
            .services
            .iter()
            .filter(|s| !overlay.ignore_list.contains(&s.observed.service_hint))
            .filter_map(|s| present_service(s, stored))
            .collect(),
        None => Vec::new(),
    };
    if services.is_empty() {
        return None;
    }

    let name = stored
        .and_then(|h| h.name())
        .or(host.hostname.as_deref())
        .unwrap_or_default();

    Some(HostView {
        address: host.address.clone(),
        name: name.to_string(),
        favorite: stored.and_then(|h| h.favorite()).unwrap_or(host.favorite),
        hidden: stored.and_then(|h| h.hidden()).unwrap_or(false),
        first_seen: stored.and_then(|h| h.first_seen),
        last_seen: stored.and_then(|h| h.last_seen),
        services,
        extra: stored.map(|h| extra_fields(&h.fields)).unwrap_or_default(),
    })
}

/// One view per snapshot host with something left to show, in snapshot order.
pub fn present(snapshot: &Snapshot, overlay: &OverlayConfig) -> Vec<HostView> {
    snapshot
        .hosts
        .iter()
        .filter_map(|host| present_host(host, overlay))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::{OverlayService, PortObservation, Protocol};

    fn service(port: u16, hint: &str, display_name: &str) -> EnrichedService {
        EnrichedService {
            observed: PortObservation {
                port,
                protocol: Protocol::Tcp,
                state: "open".to_string(),
                service_hint: hint.to_string(),
                version: None,
            },
            display_name: display_name.to_string(),
            icon: Some(format!("/ico/{}.png", port)),
        }
    }

    fn snapshot(services: Vec<EnrichedService>) -> Snapshot {
        Snapshot {
            scanned_at: Some(Utc::now()),
            hosts: vec![HostSnapshot {
                address: "10.0.0.5".to_string(),
                hostname: Some("nas.lan".to_string()),
                favorite: false,
                services,
            }],
        }
    }

    fn overlay_with_ports(ports: &[u16]) -> OverlayConfig {
        let mut host = OverlayHost::new("10.0.0.5");
        host.services = ports.iter().map(|p| OverlayService::new(*p)).collect();
        OverlayConfig {
            ignore_list: vec!["upnp".to_string()],
            hosts: vec![host],
        }
    }

    #[test]
    fn test_ignore_list_filters_services() {
        let snap = snapshot(vec![service(80, "http", "Web"), service(1900, "upnp", "upnp")]);
        let views = present(&snap, &overlay_with_ports(&[80, 1900]));

        let ports: Vec<u16> = views[0].services.iter().map(|s| s.port).collect();
        assert_eq!(ports, vec![80]);
    }

    #[test]
    fn test_overrides_win_over_snapshot() {
        let snap = snapshot(vec![service(80, "http", "Web"), service(631, "ipp", "CUPS")]);
        let mut overlay = overlay_with_ports(&[80, 631]);
        let host = &mut overlay.hosts[0];
        host.fields.insert("name".into(), OverlayValue::Text("printer-box".into()));
        host.fields.insert("favorite".into(), OverlayValue::Bool(true));
        host.fields.insert("room".into(), OverlayValue::Text("office".into()));
        let svc = &mut host.services[1];
        svc.fields.insert("name".into(), OverlayValue::Text("My Printer".into()));
        svc.fields.insert("icon".into(), OverlayValue::Text("/ico/custom.svg".into()));
        svc.fields.insert("hidden".into(), OverlayValue::Bool(true));

        let views = present(&snap, &overlay);
        let view = &views[0];
        assert_eq!(view.name, "printer-box");
        assert!(view.favorite);
        assert_eq!(view.extra.get("room"), Some(&OverlayValue::Text("office".into())));
        assert!(!view.extra.contains_key("name"));

        assert_eq!(view.services[0].name, "Web");
        assert_eq!(view.services[0].icon.as_deref(), Some("/ico/80.png"));
        assert_eq!(view.services[1].name, "My Printer");
        assert_eq!(view.services[1].icon.as_deref(), Some("/ico/custom.svg"));
        assert!(view.services[1].hidden);
    }

    #[test]
    fn test_unpaired_services_dropped() {
        let snap = snapshot(vec![service(80, "http", "Web"), service(443, "https", "Web")]);

        let views = present(&snap, &overlay_with_ports(&[443]));
        assert_eq!(views[0].services.len(), 1);
        assert_eq!(views[0].services[0].port, 443);

        assert!(present(&snap, &OverlayConfig::default()).is_empty());
    }

    #[test]
    fn test_hosts_without_services_are_dropped() {
        let snap = snapshot(vec![service(1900, "upnp", "upnp")]);
        assert!(present(&snap, &overlay_with_ports(&[1900])).is_empty());
    }

    #[test]
    fn test_hostname_is_default_name() {
        let snap = snapshot(vec![service(80, "http", "Web")]);
        let mut overlay = overlay_with_ports(&[80]);

        assert_eq!(present(&snap, &overlay)[0].name, "nas.lan");

        overlay.hosts[0].fields.insert("name".into(), OverlayValue::Text("storage".into()));
        assert_eq!(present(&snap, &overlay)[0].name, "storage");
    }
}
