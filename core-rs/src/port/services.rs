//! Service-instance detection from port names
//!
//! A port name is `service.instance.suffix`, where the instance part (and its
//! separator) is omitted for a singleton service. A bare `suffix` is an
//! application-specific port that belongs to no service.

use super::PortRole;

/// Per-role mapping from suffix to full port name, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSuffixMapping {
    pub publishers: Vec<(String, String)>,
    pub subscribers: Vec<(String, String)>,
    pub clients: Vec<(String, String)>,
    pub servers: Vec<(String, String)>,
}

impl PortSuffixMapping {
    pub fn entries(&self, role: PortRole) -> &[(String, String)] {
        match role {
            PortRole::Publisher => &self.publishers,
            PortRole::Subscriber => &self.subscribers,
            PortRole::Client => &self.clients,
            PortRole::Server => &self.servers,
        }
    }

    fn entries_mut(&mut self, role: PortRole) -> &mut Vec<(String, String)> {
        match role {
            PortRole::Publisher => &mut self.publishers,
            PortRole::Subscriber => &mut self.subscribers,
            PortRole::Client => &mut self.clients,
            PortRole::Server => &mut self.servers,
        }
    }

    /// Full port name for a role and suffix
    pub fn get(&self, role: PortRole, suffix: &str) -> Option<&str> {
        self.entries(role)
            .iter()
            .find(|(s, _)| s == suffix)
            .map(|(_, full)| full.as_str())
    }

    pub fn is_empty(&self) -> bool {
        PortRole::ALL.iter().all(|r| self.entries(*r).is_empty())
    }

    fn insert(&mut self, role: PortRole, suffix: &str, full: &str) {
        let entries = self.entries_mut(role);
        match entries.iter_mut().find(|(s, _)| s == suffix) {
            Some(entry) => entry.1 = full.to_string(),
            None => entries.push((suffix.to_string(), full.to_string())),
        }
    }
}

/// One detected instance of a service on a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    pub service: String,
    pub instance: String,
    pub ports: PortSuffixMapping,
}

fn split_port_name(name: &str) -> (&str, &str, &str) {
    let mut parts = name.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(instance), Some(suffix)) => (service, instance, suffix),
        (Some(service), Some(suffix), None) => (service, "", suffix),
        _ => ("", "", name),
    }
}

fn instance_mut<'a>(
    out: &'a mut Vec<ServiceInstance>,
    service: &str,
    instance: &str,
) -> &'a mut ServiceInstance {
    let pos = match out
        .iter()
        .position(|s| s.service == service && s.instance == instance)
    {
        Some(pos) => pos,
        None => {
            // Keep instances of one service adjacent, in first-seen order
            let insert_at = out
                .iter()
                .rposition(|s| s.service == service)
                .map(|p| p + 1)
                .unwrap_or(out.len());
            out.insert(
                insert_at,
                ServiceInstance {
                    service: service.to_string(),
                    instance: instance.to_string(),
                    ports: PortSuffixMapping::default(),
                },
            );
            insert_at
        }
    };
    &mut out[pos]
}

/// Group every port of a node into service instances
///
/// Services appear in first-seen order; instances of a service are
/// adjacent and also in first-seen order.
pub fn detect_service_instances<'a>(
    ports: impl IntoIterator<Item = (PortRole, &'a str)>,
) -> Vec<ServiceInstance> {
    let mut out: Vec<ServiceInstance> = Vec::new();
    for (role, name) in ports {
        let (service, instance, suffix) = split_port_name(name);
        instance_mut(&mut out, service, instance)
            .ports
            .insert(role, suffix, name);
    }
    out
}

/// Find the instances of one named service among a node's ports
///
/// Only ports whose suffix is listed for their role are considered; the
/// result is sorted by instance name so allocation over it is deterministic.
pub fn detect_service<'a>(
    ports: impl IntoIterator<Item = (PortRole, &'a str)>,
    prefix: &str,
    suffixes: &[(PortRole, &str)],
) -> Vec<ServiceInstance> {
    let mut out: Vec<ServiceInstance> = Vec::new();

    for (role, name) in ports {
        let Some(rest) = name
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('.'))
        else {
            continue;
        };

        for (_, suffix) in suffixes.iter().filter(|(r, _)| *r == role) {
            let instance = if rest == *suffix {
                ""
            } else if let Some(head) = rest
                .strip_suffix(suffix)
                .and_then(|h| h.strip_suffix('.'))
            {
                head
            } else {
                continue;
            };
            instance_mut(&mut out, prefix, instance)
                .ports
                .insert(role, suffix, name);
        }
    }

    out.sort_by(|a, b| a.instance.cmp(&b.instance));
    out
}
