//! Traefik label generation.

use std::collections::BTreeMap;

use super::{ProxySettings, RoutingConfig};

/// Router (and service) name for a resource.
pub fn router_name(resource_id: &str) -> String {
    format!("dockyard-{}", resource_id)
}

/// Build the proxy labels for a resource's container.
///
/// Without routing only the backend port is declared, so the container stays
/// unexposed. Pure: same inputs, same map.
pub fn generate_labels(
    resource_id: &str,
    routing: Option<&RoutingConfig>,
    internal_port: u16,
    shared_backend: bool,
    settings: &ProxySettings,
) -> BTreeMap<String, String> {
    let router = router_name(resource_id);
    let mut labels = BTreeMap::new();

    labels.insert(
        format!("traefik.http.services.{}.loadbalancer.server.port", router),
        internal_port.to_string(),
    );

    let Some(routing) = routing else {
        return labels;
    };

    let mut rule = format!("Host(`{}`)", routing.host());
    if let Some(path) = &routing.path {
        rule.push_str(&format!(" && PathPrefix(`{}`)", path));
    }

    let prefix = format!("traefik.http.routers.{}", router);
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert("traefik.docker.network".to_string(), settings.network.clone());
    labels.insert(format!("{}.rule", prefix), rule);
    labels.insert(format!("{}.entrypoints", prefix), settings.entrypoint.clone());
    labels.insert(format!("{}.service", prefix), router.clone());

    if settings.tls {
        labels.insert(format!("{}.tls", prefix), "true".to_string());
        if let Some(resolver) = &settings.cert_resolver {
            labels.insert(format!("{}.tls.certresolver", prefix), resolver.clone());
        }
    }

    if shared_backend {
        let middleware = format!("{}-headers", router);
        labels.insert(
            format!(
                "traefik.http.middlewares.{}.headers.customrequestheaders.X-Resource-Id",
                middleware
            ),
            resource_id.to_string(),
        );
        labels.insert(format!("{}.middlewares", prefix), middleware);
    }

    labels
}
