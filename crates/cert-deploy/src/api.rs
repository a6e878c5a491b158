use crate::types::EnrollmentId;
use models::{Network, TenantId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Domain validation status on an enrollment.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrollmentDomain {
    pub name: String,
    #[serde(default)]
    pub validated: bool,
}

/// The enrollment fields the coordinator reads; everything else passes
/// through untouched.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    #[serde(rename = "enrollmentId")]
    pub id: EnrollmentId,
    pub status: String,
    #[serde(default)]
    pub sans: Vec<String>,
    #[serde(default)]
    pub domains: Vec<EnrollmentDomain>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl Enrollment {
    pub fn all_domains_validated(&self) -> bool {
        self.domains.iter().all(|d| d.validated)
    }

    pub fn is_deployable_status(&self) -> bool {
        matches!(self.status.as_str(), "active" | "modified")
    }
}

/// One hostname row of a property version. The certificate reference is
/// the only field the coordinator writes; unknown fields round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyHostname {
    pub cname_from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_enrollment_id: Option<EnrollmentId>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

/// CertBackend abstracts the enrollment, deployment, and property
/// endpoints so the coordinator is testable against a scripted double.
#[async_trait::async_trait]
pub trait CertBackend: Send + Sync + 'static {
    async fn enrollment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
    ) -> Result<Enrollment, anyhow::Error>;

    /// POST a deployment; returns the assigned deployment id.
    async fn create_deployment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        network: Network,
    ) -> Result<u64, anyhow::Error>;

    /// One poll of deployment status: `active`, `pending`, `in-progress`,
    /// `failed`, or `cancelled`.
    async fn deployment_status(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        deployment_id: u64,
    ) -> Result<String, anyhow::Error>;

    async fn cancel_deployment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        deployment_id: u64,
    ) -> Result<(), anyhow::Error>;

    async fn latest_property_version(
        &self,
        tenant: &TenantId,
        property_id: &str,
    ) -> Result<u64, anyhow::Error>;

    async fn property_hostnames(
        &self,
        tenant: &TenantId,
        property_id: &str,
        version: u64,
    ) -> Result<Vec<PropertyHostname>, anyhow::Error>;

    async fn update_property_hostnames(
        &self,
        tenant: &TenantId,
        property_id: &str,
        version: u64,
        hostnames: &[PropertyHostname],
    ) -> Result<(), anyhow::Error>;
}

/// ClientProvider hands out a signed client for a tenant; injected by the
/// context layer.
pub trait ClientProvider: Send + Sync + 'static {
    fn client_for(&self, tenant: &TenantId) -> Result<edgegrid::Client, anyhow::Error>;
}

impl<F> ClientProvider for F
where
    F: Fn(&TenantId) -> Result<edgegrid::Client, anyhow::Error> + Send + Sync + 'static,
{
    fn client_for(&self, tenant: &TenantId) -> Result<edgegrid::Client, anyhow::Error> {
        self(tenant)
    }
}

const ENROLLMENT_ACCEPT: &str = "application/vnd.cps.enrollment.v11+json";
const DEPLOYMENT_ACCEPT: &str = "application/vnd.cps.deployment.v7+json";

/// EdgeCertBackend is the production backend over the signed client.
pub struct EdgeCertBackend {
    provider: Arc<dyn ClientProvider>,
}

impl EdgeCertBackend {
    pub fn new(provider: Arc<dyn ClientProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl CertBackend for EdgeCertBackend {
    async fn enrollment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
    ) -> Result<Enrollment, anyhow::Error> {
        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::get(format!("/cps/v2/enrollments/{id}"))
            .header("Accept", ENROLLMENT_ACCEPT);
        Ok(client.send_json(request).await?)
    }

    async fn create_deployment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        network: Network,
    ) -> Result<u64, anyhow::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Created {
            deployment_id: u64,
        }

        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::post(format!("/cps/v2/enrollments/{id}/deployments"))
            .header("Accept", DEPLOYMENT_ACCEPT)
            .json(&serde_json::json!({ "targetNetwork": network.as_str() }))?;

        let created: Created = client.send_json(request).await?;
        Ok(created.deployment_id)
    }

    async fn deployment_status(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        deployment_id: u64,
    ) -> Result<String, anyhow::Error> {
        #[derive(Deserialize)]
        struct Status {
            status: String,
        }

        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::get(format!(
            "/cps/v2/enrollments/{id}/deployments/{deployment_id}"
        ))
        .header("Accept", DEPLOYMENT_ACCEPT);

        let status: Status = client.send_json(request).await?;
        Ok(status.status)
    }

    async fn cancel_deployment(
        &self,
        tenant: &TenantId,
        id: EnrollmentId,
        deployment_id: u64,
    ) -> Result<(), anyhow::Error> {
        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::delete(format!(
            "/cps/v2/enrollments/{id}/deployments/{deployment_id}"
        ));
        client.send(request).await?;
        Ok(())
    }

    async fn latest_property_version(
        &self,
        tenant: &TenantId,
        property_id: &str,
    ) -> Result<u64, anyhow::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Versions {
            versions: VersionItems,
        }
        #[derive(Deserialize)]
        struct VersionItems {
            items: Vec<VersionItem>,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct VersionItem {
            property_version: u64,
        }

        let client = self.provider.client_for(tenant)?;
        let request =
            edgegrid::Request::get(format!("/papi/v1/properties/{property_id}/versions/latest"));

        let versions: Versions = client.send_json(request).await?;
        versions
            .versions
            .items
            .first()
            .map(|item| item.property_version)
            .ok_or_else(|| anyhow::anyhow!("property {property_id} has no versions"))
    }

    async fn property_hostnames(
        &self,
        tenant: &TenantId,
        property_id: &str,
        version: u64,
    ) -> Result<Vec<PropertyHostname>, anyhow::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Hostnames {
            hostnames: HostnameItems,
        }
        #[derive(Deserialize)]
        struct HostnameItems {
            items: Vec<PropertyHostname>,
        }

        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::get(format!(
            "/papi/v1/properties/{property_id}/versions/{version}/hostnames"
        ));

        let hostnames: Hostnames = client.send_json(request).await?;
        Ok(hostnames.hostnames.items)
    }

    async fn update_property_hostnames(
        &self,
        tenant: &TenantId,
        property_id: &str,
        version: u64,
        hostnames: &[PropertyHostname],
    ) -> Result<(), anyhow::Error> {
        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::put(format!(
            "/papi/v1/properties/{property_id}/versions/{version}/hostnames"
        ))
        .json(&serde_json::json!({ "hostnames": hostnames }))?;

        client.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn enrollment_parses_and_checks_preconditions() {
        let enrollment: Enrollment = serde_json::from_value(serde_json::json!({
            "enrollmentId": 10001,
            "status": "active",
            "sans": ["www.example.net"],
            "domains": [
                {"name": "www.example.net", "validated": true},
                {"name": "api.example.net", "validated": true},
            ],
            "certificateType": "san",
        }))
        .unwrap();

        assert_eq!(enrollment.id, 10001);
        assert!(enrollment.all_domains_validated());
        assert!(enrollment.is_deployable_status());
        assert_eq!(
            enrollment.extensions.get("certificateType").and_then(|v| v.as_str()),
            Some("san")
        );
    }

    #[test]
    fn unvalidated_domains_and_wrong_status_fail_the_checks() {
        let enrollment: Enrollment = serde_json::from_value(serde_json::json!({
            "enrollmentId": 10002,
            "status": "incomplete",
            "domains": [{"name": "www.example.net", "validated": false}],
        }))
        .unwrap();

        assert!(!enrollment.all_domains_validated());
        assert!(!enrollment.is_deployable_status());
    }

    #[test]
    fn hostname_rows_round_trip_unknown_fields() {
        let row: PropertyHostname = serde_json::from_value(serde_json::json!({
            "cnameFrom": "www.example.net",
            "cnameTo": "www.example.net.edgekey.example",
            "cnameType": "EDGE_HOSTNAME",
        }))
        .unwrap();
        assert_eq!(row.cert_enrollment_id, None);

        let mut linked = row.clone();
        linked.cert_enrollment_id = Some(10001);
        let json = serde_json::to_value(&linked).unwrap();
        assert_eq!(json["certEnrollmentId"], 10001);
        assert_eq!(json["cnameTo"], "www.example.net.edgekey.example");
    }
}
