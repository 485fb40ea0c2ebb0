#![cfg(test)]

use std::sync::Arc;

use crate::ProjectConfig;

/// Small project used by the end-to-end scenarios: `feature_2` is a single unrestricted
/// experiment, `feature_1` has two variations `a`/`b`, and `feature_3` only has an "everyone
/// else" rollout rule at 0% traffic.
pub const DATAFILE_S1: &str = r#"{
    "version": "4",
    "revision": "1",
    "accountId": "10367498574",
    "projectId": "10431130345",
    "anonymizeIP": true,
    "botFiltering": false,
    "sendFlagDecisions": true,
    "region": "US",
    "attributes": [{"id": "10401066117", "key": "gender"}],
    "audiences": [],
    "typedAudiences": [],
    "events": [{"id": "10404198134", "key": "event1", "experimentIds": ["10390977673"]}],
    "groups": [],
    "integrations": [],
    "experiments": [
        {
            "id": "10390977673",
            "key": "exp_no_audience",
            "layerId": "10420273888",
            "status": "Running",
            "variations": [
                {
                    "id": "10389729780",
                    "key": "variation_with_traffic",
                    "featureEnabled": true,
                    "variables": [{"id": "v1", "value": "on-value"}]
                }
            ],
            "trafficAllocation": [{"entityId": "10389729780", "endOfRange": 10000}],
            "audienceIds": [],
            "forcedVariations": {}
        },
        {
            "id": "exp1-id",
            "key": "exp_1",
            "layerId": "layer-2",
            "status": "Running",
            "variations": [
                {"id": "var-a", "key": "a", "featureEnabled": true, "variables": []},
                {"id": "var-b", "key": "b", "featureEnabled": false, "variables": []}
            ],
            "trafficAllocation": [
                {"entityId": "var-a", "endOfRange": 5000},
                {"entityId": "var-b", "endOfRange": 10000}
            ],
            "audienceIds": [],
            "forcedVariations": {}
        }
    ],
    "featureFlags": [
        {
            "id": "f2",
            "key": "feature_2",
            "rolloutId": "",
            "experimentIds": ["10390977673"],
            "variables": [{"id": "v1", "key": "label", "type": "string", "defaultValue": "off-value"}]
        },
        {"id": "f1", "key": "feature_1", "rolloutId": "", "experimentIds": ["exp1-id"], "variables": []},
        {"id": "f3", "key": "feature_3", "rolloutId": "rollout-3", "experimentIds": [], "variables": []}
    ],
    "rollouts": [
        {
            "id": "rollout-3",
            "experiments": [
                {
                    "id": "rule-ee",
                    "key": "default-rollout-rule",
                    "layerId": "rollout-3",
                    "status": "Running",
                    "variations": [{"id": "var-off", "key": "off", "featureEnabled": false, "variables": []}],
                    "trafficAllocation": [{"entityId": "var-off", "endOfRange": 0}],
                    "audienceIds": []
                }
            ]
        }
    ]
}"#;

/// Project exercising audiences, groups, rollouts, CMAB and ODP.
pub fn datafile_with_everything() -> String {
    r#"{
    "version": "4",
    "revision": "101",
    "accountId": "account-1",
    "projectId": "project-1",
    "anonymizeIP": false,
    "botFiltering": true,
    "sendFlagDecisions": true,
    "attributes": [
        {"id": "attr-age", "key": "age"},
        {"id": "attr-browser", "key": "browser"},
        {"id": "attr-country", "key": "country"}
    ],
    "audiences": [
        {
            "id": "aud-adult",
            "name": "adults",
            "conditions": "[\"and\", {\"type\": \"custom_attribute\", \"name\": \"age\", \"match\": \"ge\", \"value\": 18}]"
        },
        {
            "id": "aud-chrome",
            "name": "chrome users",
            "conditions": "[\"and\", [\"or\", {\"type\": \"custom_attribute\", \"name\": \"browser\", \"value\": \"chrome\"}]]"
        }
    ],
    "typedAudiences": [
        {
            "id": "aud-vip",
            "name": "vip segment",
            "conditions": ["or", {"type": "third_party_dimension", "name": "odp.audiences", "match": "qualified", "value": "vip"}]
        }
    ],
    "integrations": [{"key": "odp", "publicKey": "odp-public-key", "host": "https://odp.example.com"}],
    "events": [{"id": "event-1", "key": "purchase", "experimentIds": ["exp-1"]}],
    "experiments": [
        {
            "id": "exp-1",
            "key": "exp_with_audience",
            "layerId": "layer-1",
            "status": "Running",
            "audienceIds": ["aud-adult"],
            "audienceConditions": ["and", "aud-adult"],
            "variations": [
                {"id": "10001", "key": "a", "featureEnabled": true, "variables": [{"id": "var-1", "value": "42"}]},
                {"id": "10002", "key": "b", "featureEnabled": false, "variables": [{"id": "var-1", "value": "43"}]}
            ],
            "trafficAllocation": [
                {"entityId": "10001", "endOfRange": 5000},
                {"entityId": "10002", "endOfRange": 10000}
            ],
            "forcedVariations": {"whitelisted_user": "b"}
        },
        {
            "id": "exp-2",
            "key": "exp_with_audience_ids",
            "layerId": "layer-2",
            "status": "Running",
            "audienceIds": ["aud-adult"],
            "variations": [{"id": "20001", "key": "c", "featureEnabled": true, "variables": []}],
            "trafficAllocation": [{"entityId": "20001", "endOfRange": 10000}],
            "forcedVariations": {}
        },
        {
            "id": "exp-paused",
            "key": "paused_exp",
            "layerId": "layer-3",
            "status": "Paused",
            "audienceIds": [],
            "variations": [{"id": "30001", "key": "p", "featureEnabled": true, "variables": []}],
            "trafficAllocation": [{"entityId": "30001", "endOfRange": 10000}],
            "forcedVariations": {}
        },
        {
            "id": "exp-cmab",
            "key": "cmab_exp",
            "layerId": "layer-4",
            "status": "Running",
            "audienceIds": [],
            "variations": [
                {"id": "40001", "key": "x", "featureEnabled": true, "variables": []},
                {"id": "40002", "key": "y", "featureEnabled": true, "variables": []}
            ],
            "trafficAllocation": [],
            "forcedVariations": {},
            "cmab": {"attributeIds": ["attr-age"], "trafficAllocation": 10000}
        }
    ],
    "groups": [
        {
            "id": "group-1",
            "policy": "random",
            "trafficAllocation": [
                {"entityId": "group-exp-1", "endOfRange": 5000},
                {"entityId": "group-exp-2", "endOfRange": 10000}
            ],
            "experiments": [
                {
                    "id": "group-exp-1",
                    "key": "group_exp_1",
                    "layerId": "layer-g",
                    "status": "Running",
                    "audienceIds": [],
                    "variations": [{"id": "50001", "key": "g1", "featureEnabled": true, "variables": []}],
                    "trafficAllocation": [{"entityId": "50001", "endOfRange": 10000}],
                    "forcedVariations": {}
                },
                {
                    "id": "group-exp-2",
                    "key": "group_exp_2",
                    "layerId": "layer-g",
                    "status": "Running",
                    "audienceIds": [],
                    "variations": [{"id": "50002", "key": "g2", "featureEnabled": true, "variables": []}],
                    "trafficAllocation": [{"entityId": "50002", "endOfRange": 10000}],
                    "forcedVariations": {}
                }
            ]
        }
    ],
    "featureFlags": [
        {
            "id": "flag-1",
            "key": "feature_1",
            "rolloutId": "rollout-1",
            "experimentIds": ["exp-1"],
            "variables": [
                {"id": "var-1", "key": "count", "type": "integer", "defaultValue": "1"},
                {"id": "var-2", "key": "title", "type": "string", "defaultValue": "hello"},
                {"id": "var-3", "key": "config", "type": "string", "subType": "json", "defaultValue": "{\"k\": 1}"},
                {"id": "var-4", "key": "ratio", "type": "double", "defaultValue": "0.5"},
                {"id": "var-5", "key": "on", "type": "boolean", "defaultValue": "true"}
            ]
        },
        {"id": "flag-2", "key": "feature_cmab", "rolloutId": "", "experimentIds": ["exp-cmab"], "variables": []},
        {"id": "flag-3", "key": "feature_group", "rolloutId": "", "experimentIds": ["group-exp-1", "group-exp-2"], "variables": []},
        {"id": "flag-4", "key": "feature_rollout", "rolloutId": "rollout-2", "experimentIds": [], "variables": []}
    ],
    "rollouts": [
        {
            "id": "rollout-1",
            "experiments": [
                {
                    "id": "rule-1",
                    "key": "targeted_rule",
                    "layerId": "rollout-1",
                    "status": "Running",
                    "audienceIds": ["aud-chrome"],
                    "audienceConditions": ["or", "aud-chrome"],
                    "variations": [{"id": "60001", "key": "rollout_on", "featureEnabled": true, "variables": [{"id": "var-1", "value": "7"}]}],
                    "trafficAllocation": [{"entityId": "60001", "endOfRange": 10000}]
                },
                {
                    "id": "rule-2",
                    "key": "everyone_else",
                    "layerId": "rollout-1",
                    "status": "Running",
                    "audienceIds": [],
                    "variations": [{"id": "60002", "key": "rollout_off", "featureEnabled": false, "variables": []}],
                    "trafficAllocation": [{"entityId": "60002", "endOfRange": 10000}]
                }
            ]
        },
        {
            "id": "rollout-2",
            "experiments": [
                {
                    "id": "rule-3",
                    "key": "chrome_rule",
                    "layerId": "rollout-2",
                    "status": "Running",
                    "audienceIds": ["aud-chrome"],
                    "variations": [{"id": "60003", "key": "rollout_2_targeted", "featureEnabled": true, "variables": []}],
                    "trafficAllocation": [{"entityId": "60003", "endOfRange": 0}]
                },
                {
                    "id": "rule-3b",
                    "key": "adult_rule",
                    "layerId": "rollout-2",
                    "status": "Running",
                    "audienceIds": ["aud-adult"],
                    "variations": [{"id": "60005", "key": "rollout_2_adult", "featureEnabled": true, "variables": []}],
                    "trafficAllocation": [{"entityId": "60005", "endOfRange": 10000}]
                },
                {
                    "id": "rule-4",
                    "key": "everyone_else_2",
                    "layerId": "rollout-2",
                    "status": "Running",
                    "audienceIds": [],
                    "variations": [{"id": "60004", "key": "rollout_2_on", "featureEnabled": true, "variables": []}],
                    "trafficAllocation": [{"entityId": "60004", "endOfRange": 10000}]
                }
            ]
        }
    ]
}"#
    .to_string()
}

pub fn s1_config() -> Arc<ProjectConfig> {
    Arc::new(ProjectConfig::from_datafile(DATAFILE_S1).expect("fixture should parse"))
}

pub fn everything_config() -> Arc<ProjectConfig> {
    Arc::new(ProjectConfig::from_datafile(datafile_with_everything()).expect("fixture should parse"))
}

/// Same as [DATAFILE_S1] with a different revision.
pub fn s1_datafile_with_revision(revision: &str) -> String {
    DATAFILE_S1.replace("\"revision\": \"1\"", &format!("\"revision\": \"{}\"", revision))
}
