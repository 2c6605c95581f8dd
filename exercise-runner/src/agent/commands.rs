use super::AgentRole;
use cyber_range::message::Payload;
use serde_json::Value;

/// What an agent does with one command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub role: AgentRole,
    pub command_type: &'static str,
    /// MITRE ATT&CK technique for red commands, defensive capability for blue
    pub technique: &'static str,
    /// Task description with `{param}` placeholders filled from the command
    pub template: &'static str,
    /// Command parameter naming the system the command acts on
    pub target_param: Option<&'static str>,
}

const fn spec(
    role: AgentRole,
    command_type: &'static str,
    technique: &'static str,
    template: &'static str,
    target_param: Option<&'static str>,
) -> CommandSpec {
    CommandSpec {
        role,
        command_type,
        technique,
        template,
        target_param,
    }
}

use AgentRole::*;

#[rustfmt::skip]
pub const COMMANDS: &[CommandSpec] = &[
    // recon
    spec(Recon, "osint_gathering", "T1592",
        "Gather OSINT about {target} focusing on {information_type}", Some("target")),
    spec(Recon, "network_mapping", "T1595",
        "Perform {scan_type} scan on {target_range} to map network topology", Some("target_range")),
    spec(Recon, "vulnerability_scan", "T1595",
        "Perform {scan_level} vulnerability scan on {target}", Some("target")),
    spec(Recon, "asset_enumeration", "T1596",
        "Perform {enumeration_type} enumeration for {domain}", Some("domain")),
    // social engineering
    spec(SocialEngineering, "phishing_campaign", "T1566",
        "Generate phishing content for {target_role} targeting {scenario_type} with {urgency_level} urgency",
        Some("target_role")),
    spec(SocialEngineering, "pretexting_scenario", "T1656",
        "Develop {pretext_type} pretexting scenario targeting {target_person} to achieve {objective}",
        Some("target_person")),
    spec(SocialEngineering, "target_profiling", "T1598",
        "Profile {target_person} for {profiling_depth} social engineering susceptibility",
        Some("target_person")),
    spec(SocialEngineering, "tactic_analysis", "T1566",
        "Analyze {tactic_type} psychological manipulation tactic in context: {context}", None),
    // exploitation
    spec(Exploitation, "vulnerability_chain", "T1203",
        "Analyze {chain_complexity} exploit chain of {vulnerabilities} against {target_system}",
        Some("target_system")),
    spec(Exploitation, "control_bypass", "T1562",
        "Analyze bypass of {security_control} using {bypass_method} in {target_environment}",
        Some("target_environment")),
    spec(Exploitation, "attack_path", "T1210",
        "Map attack paths from {entry_point} to {target_system}", Some("target_system")),
    // lateral movement
    spec(LateralMovement, "network_traversal", "T1021",
        "Analyze network traversal from {starting_point} to {target_destination} with constraints: {network_constraints}",
        Some("target_destination")),
    spec(LateralMovement, "privilege_escalation", "T1574",
        "Simulate privilege escalation from {current_privilege} to {target_privilege} on {system_type}",
        Some("system_type")),
    spec(LateralMovement, "persistence_mechanism", "T1547",
        "Analyze {stealth_level} stealth {mechanism_type} persistence for {target_system}",
        Some("target_system")),
    spec(LateralMovement, "defense_evasion", "T1028",
        "Analyze {evasion_method} evasion for {defense_type} in {target_environment}",
        Some("target_environment")),
    // detection
    spec(Detection, "anomaly_detection", "detect",
        "Perform {analysis_type} anomaly detection on {log_data} against baseline: {baseline_behavior}",
        None),
    spec(Detection, "ioc_generation", "detect",
        "Generate {ioc_type} IOCs from attack data: {attack_data}", None),
    spec(Detection, "alert_correlation", "detect",
        "Perform {correlation_method} alert correlation for alerts: {alerts}", None),
    spec(Detection, "detection_rule", "protect",
        "Create {rule_type} detection rule for {threat_pattern} on {target_platform}", None),
    // response
    spec(Response, "incident_triage", "respond",
        "Perform incident triage for data: {incident_data} with severity factors: {severity_factors} and business impact: {business_impact}",
        None),
    spec(Response, "containment_strategy", "respond",
        "Develop {containment_level} containment strategy for {threat_vector} affecting {affected_systems}",
        None),
    spec(Response, "remediation_procedure", "recover",
        "Guide {recovery_priority} remediation for {incident_type} affecting {compromised_assets}",
        None),
    spec(Response, "communication_plan", "respond",
        "Create communication plan for {incident_severity} incident with stakeholders: {stakeholders}",
        None),
    // threat intel
    spec(ThreatIntel, "threat_attribution", "identify",
        "Attribute threat based on indicators: {attack_indicators} and patterns: {attack_patterns}",
        None),
    spec(ThreatIntel, "ttp_mapping", "identify",
        "Map {mapping_granularity} TTPs for attack data: {attack_data} using ATT&CK {framework_version}",
        None),
    spec(ThreatIntel, "threat_landscape", "identify",
        "Analyze {time_horizon} threat landscape for {sector_focus} sector", None),
    spec(ThreatIntel, "intelligence_report", "identify",
        "Generate {report_type} intelligence report for {audience} from data: {intelligence_data}",
        None),
    spec(ThreatIntel, "defense_strategy", "protect",
        "Recommend {priority_level} defense strategy for threat: {threat_assessment}", None),
];

/// Placeholder for parameters the command did not supply
const UNSPECIFIED: &str = "unspecified";

/// Look up what `role` does with `command_type`.
pub fn find(role: AgentRole, command_type: &str) -> Option<&'static CommandSpec> {
    COMMANDS
        .iter()
        .find(|c| c.role == role && c.command_type == command_type)
}

/// Command types `role` understands.
pub fn supported(role: AgentRole) -> Vec<&'static str> {
    COMMANDS
        .iter()
        .filter(|c| c.role == role)
        .map(|c| c.command_type)
        .collect()
}

impl CommandSpec {
    /// Fill the template from command parameters.
    pub fn render(&self, params: &Payload) -> String {
        let mut out = String::with_capacity(self.template.len() + 32);
        let mut rest = self.template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match after.find('}') {
                Some(close) => {
                    out.push_str(&param_text(params, &after[..close]));
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// The system this command acts on, if it names one.
    pub fn target<'a>(&self, params: &'a Payload) -> Option<&'a str> {
        self.target_param
            .and_then(|key| params.get(key))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

fn param_text(params: &Payload, key: &str) -> String {
    match params.get(key) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Null) | None => UNSPECIFIED.to_string(),
        Some(Value::String(_)) => UNSPECIFIED.to_string(),
        Some(other) => other.to_string(),
    }
}
