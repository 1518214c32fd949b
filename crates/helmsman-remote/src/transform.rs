//! Parameter transformations applied before posting to the service.
//!
//! Deployment documents keep snake_case keys; the service expects
//! camelCase form fields with lists exploded into repeated fields.
//! Zones are region-qualified, security-group names are translated to
//! ids, and inside a VPC (`subnet_purpose == internal`) load balancers
//! are addressed under a VPC-scoped key.

use serde_json::Value;

use helmsman_store::Parameters;

use crate::client::SecurityGroup;
use crate::error::{RemoteError, RemoteResult};

/// Environment-dependent inputs to the transformation.
#[derive(Debug, Clone)]
pub struct TransformContext<'a> {
    pub region: &'a str,
    /// VPC id for this environment, required when the subnet purpose is
    /// `internal`.
    pub vpc_id: Option<&'a str>,
    /// Security groups known to the service, for name → id translation.
    pub security_groups: &'a [SecurityGroup],
    /// Security groups every deployment carries (healthcheck,
    /// monitoring), appended to the selection.
    pub required_security_groups: &'a [String],
}

/// Document keys the pipeline owns; never submitted to the service.
const BOOKKEEPING_KEYS: &[&str] = &["new_asg_name", "old_asg_name", "old_ami", "old_hash"];

/// Keys handled by dedicated rules below.
const SPECIAL_KEYS: &[&str] = &[
    "selected_zones",
    "selected_security_groups",
    "selected_load_balancers",
];

/// Build the form fields for a mutating ASG request from the merged
/// parameter map. Multi-valued keys appear once per value.
pub fn form_fields(
    parameters: &Parameters,
    ctx: &TransformContext<'_>,
) -> RemoteResult<Vec<(String, String)>> {
    let mut fields = Vec::new();

    for (key, value) in &parameters.0 {
        if BOOKKEEPING_KEYS.contains(&key.as_str()) || SPECIAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        let field = snake_to_camel(key);
        match value {
            Value::Array(items) => {
                for item in items {
                    if let Some(scalar) = scalar_to_string(item) {
                        fields.push((field.clone(), scalar));
                    }
                }
            }
            other => {
                if let Some(scalar) = scalar_to_string(other) {
                    fields.push((field, scalar));
                }
            }
        }
    }

    // Zones are submitted region-qualified.
    for zone in parameters.selected_zones() {
        fields.push(("selectedZones".to_string(), qualify_zone(ctx.region, &zone)));
    }

    // Security groups: the deployment's selection plus the groups every
    // deployment carries, names translated to ids.
    let mut groups = parameters.selected_security_groups();
    groups.extend(ctx.required_security_groups.iter().cloned());
    for group in groups {
        fields.push((
            "selectedSecurityGroups".to_string(),
            security_group_id(&group, ctx.security_groups)?,
        ));
    }

    // Load balancers: VPC-scoped key when the subnet purpose is internal.
    let load_balancers = parameters.selected_load_balancers();
    if !load_balancers.is_empty() {
        let key = if parameters.subnet_purpose() == Some("internal") {
            let vpc_id = ctx.vpc_id.ok_or_else(|| {
                RemoteError::Malformed(
                    "subnet purpose is internal but no VPC id is configured".to_string(),
                )
            })?;
            format!("selectedLoadBalancersForVpcId{vpc_id}")
        } else {
            "selectedLoadBalancers".to_string()
        };
        for load_balancer in load_balancers {
            fields.push((key.clone(), load_balancer));
        }
    }

    Ok(fields)
}

/// Prefix a bare zone letter with the region (`"a"` → `"eu-west-1a"`).
pub fn qualify_zone(region: &str, zone: &str) -> String {
    if zone.starts_with(region) {
        zone.to_string()
    } else {
        format!("{region}{zone}")
    }
}

/// Translate a security-group name to its id; ids pass through.
pub fn security_group_id(group: &str, known: &[SecurityGroup]) -> RemoteResult<String> {
    if group.starts_with("sg-") {
        return Ok(group.to_string());
    }
    known
        .iter()
        .find(|sg| sg.group_name == group)
        .map(|sg| sg.group_id.clone())
        .ok_or_else(|| RemoteError::UnknownSecurityGroup(group.to_string()))
}

fn snake_to_camel(key: &str) -> String {
    let mut parts = key.split('_');
    let mut out = String::with_capacity(key.len());
    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn known_groups() -> Vec<SecurityGroup> {
        vec![
            SecurityGroup {
                group_id: "sg-11111111".to_string(),
                group_name: "foo".to_string(),
            },
            SecurityGroup {
                group_id: "sg-22222222".to_string(),
                group_name: "healthcheck".to_string(),
            },
        ]
    }

    fn ctx<'a>(groups: &'a [SecurityGroup], required: &'a [String]) -> TransformContext<'a> {
        TransformContext {
            region: "eu-west-1",
            vpc_id: Some("vpc-abc123"),
            security_groups: groups,
            required_security_groups: required,
        }
    }

    fn field_values<'a>(fields: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        fields
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn scalar_keys_become_camel_case() {
        let mut params = Parameters::new();
        params.set("min", 1);
        params.set("desired_capacity", 2);
        params.set("health_check_type", "ELB");
        params.set("subnet_purpose", "external");

        let groups = known_groups();
        let fields = form_fields(&params, &ctx(&groups, &[])).unwrap();
        assert_eq!(field_values(&fields, "min"), vec!["1"]);
        assert_eq!(field_values(&fields, "desiredCapacity"), vec!["2"]);
        assert_eq!(field_values(&fields, "healthCheckType"), vec!["ELB"]);
        assert_eq!(field_values(&fields, "subnetPurpose"), vec!["external"]);
    }

    #[test]
    fn zones_are_region_qualified_and_repeated() {
        let mut params = Parameters::new();
        params.set("selected_zones", json!(["a", "eu-west-1b"]));

        let groups = known_groups();
        let fields = form_fields(&params, &ctx(&groups, &[])).unwrap();
        assert_eq!(
            field_values(&fields, "selectedZones"),
            vec!["eu-west-1a", "eu-west-1b"]
        );
    }

    #[test]
    fn security_group_names_translate_to_ids() {
        let mut params = Parameters::new();
        params.set("selected_security_groups", json!(["foo", "sg-33333333"]));

        let groups = known_groups();
        let required = vec!["healthcheck".to_string()];
        let fields = form_fields(&params, &ctx(&groups, &required)).unwrap();
        assert_eq!(
            field_values(&fields, "selectedSecurityGroups"),
            vec!["sg-11111111", "sg-33333333", "sg-22222222"]
        );
    }

    #[test]
    fn unknown_security_group_is_rejected() {
        let mut params = Parameters::new();
        params.set("selected_security_groups", json!(["mystery"]));

        let groups = known_groups();
        let err = form_fields(&params, &ctx(&groups, &[])).unwrap_err();
        assert!(matches!(err, RemoteError::UnknownSecurityGroup(name) if name == "mystery"));
    }

    #[test]
    fn internal_subnet_scopes_load_balancers_to_vpc() {
        let mut params = Parameters::new();
        params.set("subnet_purpose", "internal");
        params.set("selected_load_balancers", json!(["lb-1", "lb-2"]));

        let groups = known_groups();
        let fields = form_fields(&params, &ctx(&groups, &[])).unwrap();
        assert_eq!(
            field_values(&fields, "selectedLoadBalancersForVpcIdvpc-abc123"),
            vec!["lb-1", "lb-2"]
        );
        assert!(field_values(&fields, "selectedLoadBalancers").is_empty());
    }

    #[test]
    fn external_subnet_keeps_plain_load_balancer_key() {
        let mut params = Parameters::new();
        params.set("selected_load_balancers", "lb-1");

        let groups = known_groups();
        let fields = form_fields(&params, &ctx(&groups, &[])).unwrap();
        assert_eq!(field_values(&fields, "selectedLoadBalancers"), vec!["lb-1"]);
    }

    #[test]
    fn internal_subnet_without_vpc_id_is_malformed() {
        let mut params = Parameters::new();
        params.set("subnet_purpose", "internal");
        params.set("selected_load_balancers", "lb-1");

        let groups = known_groups();
        let mut context = ctx(&groups, &[]);
        context.vpc_id = None;
        let err = form_fields(&params, &context).unwrap_err();
        assert!(matches!(err, RemoteError::Malformed(_)));
    }

    #[test]
    fn bookkeeping_keys_are_not_submitted() {
        let mut params = Parameters::new();
        params.set("new_asg_name", "foo-prod-v002");
        params.set("old_asg_name", "foo-prod-v001");
        params.set("old_ami", "ami-0");
        params.set("min", 1);

        let groups = known_groups();
        let fields = form_fields(&params, &ctx(&groups, &[])).unwrap();
        assert!(fields.iter().all(|(k, _)| !k.contains("sgName") && k != "newAsgName" && k != "oldAsgName" && k != "oldAmi"));
        assert_eq!(fields.len(), 1);
    }

    #[test]
    fn zone_qualification() {
        assert_eq!(qualify_zone("eu-west-1", "a"), "eu-west-1a");
        assert_eq!(qualify_zone("eu-west-1", "eu-west-1b"), "eu-west-1b");
    }
}
