//! Friction detection: one oracle assessment per live type.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use taxon_protocol::{
    AssessmentKind, EvidencePackage, EvidenceRef, FrictionEvent, FrictionId, FrictionStatus,
    JudgePort, JudgeReply, JudgeRequest, JudgeVerdict, TaxonError, TaxonResult, TypeDefId,
    TypeDefinition,
};
use taxon_registry::TypeRegistry;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub events: Vec<FrictionEvent>,
    /// Types whose assessment was dropped, with the reason.
    pub rejected: Vec<(TypeDefId, String)>,
    /// Set when the oracle went away mid-scan. `events` is empty then.
    pub oracle_unavailable: Option<String>,
}

/// Bounded, self-contained evidence slice for one type.
pub fn payload_for(evidence: &EvidencePackage, definition: &TypeDefinition) -> Value {
    let id = &definition.id;
    json!({
        "type_id": id,
        "display_name": definition.display_name(),
        "aliases": definition.aliases,
        "tier": definition.tier,
        "extends": definition.extends,
        "fields": definition.field_names().collect::<Vec<_>>(),
        "registry_version": evidence.registry_version,
        "usage": evidence.usage_for(id),
        "overrides": evidence.overrides_for(id).collect::<Vec<_>>(),
        "field_overlaps": evidence.overlaps_for(id).collect::<Vec<_>>(),
        "separability": evidence.separability_for(id),
        "gaps": evidence.gaps,
    })
}

#[derive(Clone)]
pub struct FrictionDetector {
    judge: Arc<dyn JudgePort>,
}

impl FrictionDetector {
    pub fn new(judge: Arc<dyn JudgePort>) -> Self {
        Self { judge }
    }

    #[instrument(
        skip(self, evidence, registry),
        fields(project_id = %evidence.project_id, registry_version = evidence.registry_version)
    )]
    pub async fn detect(
        &self,
        evidence: &EvidencePackage,
        registry: &TypeRegistry,
    ) -> DetectionReport {
        let digest = evidence.digest();
        let mut report = DetectionReport::default();

        for usage in &evidence.usage {
            let Some(definition) = registry.get(&usage.type_id) else {
                report
                    .rejected
                    .push((usage.type_id.clone(), "type left the registry".to_owned()));
                continue;
            };
            let payload = payload_for(evidence, definition);
            let request = JudgeRequest::new(
                evidence.project_id.clone(),
                AssessmentKind::Friction,
                payload.clone(),
            );
            let reply = match self.judge.judge(request).await {
                Ok(reply) => reply,
                Err(TaxonError::OracleUnavailable(message)) => {
                    warn!(type_id = %usage.type_id, %message, "oracle unavailable, ending friction scan");
                    report.events.clear();
                    report.oracle_unavailable = Some(message);
                    return report;
                }
                Err(error) => {
                    warn!(type_id = %usage.type_id, %error, "friction assessment failed");
                    report.rejected.push((usage.type_id.clone(), error.to_string()));
                    continue;
                }
            };
            match interpret(evidence, &digest, &definition.id, payload, reply, registry) {
                Ok(Some(event)) => {
                    debug!(
                        type_id = %event.affected_type_id,
                        severity = ?event.severity,
                        signal = ?event.signal_type,
                        "friction detected"
                    );
                    report.events.push(event);
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(type_id = %usage.type_id, %error, "malformed friction assessment");
                    report.rejected.push((usage.type_id.clone(), error.to_string()));
                }
            }
        }
        info!(
            events = report.events.len(),
            rejected = report.rejected.len(),
            "friction scan complete"
        );
        report
    }
}

fn interpret(
    evidence: &EvidencePackage,
    digest: &str,
    subject: &TypeDefId,
    payload: Value,
    reply: JudgeReply,
    registry: &TypeRegistry,
) -> TaxonResult<Option<FrictionEvent>> {
    reply.validate_for(AssessmentKind::Friction)?;
    if reply.verdict != JudgeVerdict::Affirmed {
        return Ok(None);
    }
    let severity = reply.severity()?;
    let signal_type = reply.signal_type.ok_or_else(|| {
        TaxonError::Validation("friction reply names no signal type".to_owned())
    })?;
    let affected_type_id = reply.affected_type_id.unwrap_or_else(|| subject.clone());
    if !registry.contains(&affected_type_id) {
        return Err(TaxonError::Validation(format!(
            "friction reply names unknown type {affected_type_id}"
        )));
    }
    Ok(Some(FrictionEvent {
        id: FrictionId::default(),
        project_id: evidence.project_id.clone(),
        signal_type,
        evidence_ref: EvidenceRef {
            package_digest: digest.to_owned(),
            type_id: subject.clone(),
        },
        evidence: payload,
        severity,
        affected_type_id,
        status: FrictionStatus::Detected,
        rationale: reply.rationale,
        created_at: Utc::now(),
        schema_version: 1,
    }))
}
