use hostpool_domain::{Op, Query, Term, Value};
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

// ── Job submission ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename = "job")]
pub struct JobDefinition {
    #[serde(rename = "@group")]
    pub group: String,
    pub whiteboard: String,
    #[serde(rename = "recipeSet")]
    pub recipe_set: RecipeSetDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeSetDefinition {
    pub recipe: Vec<RecipeDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeDefinition {
    #[serde(rename = "@whiteboard")]
    pub whiteboard: String,
    #[serde(rename = "hostRequires")]
    pub host_requires: HostRequires,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostRequires {
    pub and: ConditionGroup,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ConditionGroup {
    #[serde(rename = "$value")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Condition {
    #[serde(rename = "arch")]
    Arch {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "hostname")]
    Hostname {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "memory")]
    Memory {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "disk_space")]
    DiskSpace {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "numa_node_count")]
    NumaNodeCount {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "cpu_flag")]
    CpuFlag {
        #[serde(rename = "@op")]
        op: String,
        #[serde(rename = "@value")]
        value: String,
    },
    #[serde(rename = "or")]
    Or(ConditionGroup),
}

fn op_symbol(op: Op) -> &'static str {
    match op {
        Op::Eq | Op::In => "=",
        Op::Lt => "<",
        Op::Lte => "<=",
        Op::Gt => ">",
        Op::Gte => ">=",
    }
}

type ConditionCtor = fn(String, String) -> Condition;

fn condition_ctor(field: &str) -> Option<ConditionCtor> {
    match field {
        "cpu-arch" => Some(|op, value| Condition::Arch { op, value }),
        "hostname" => Some(|op, value| Condition::Hostname { op, value }),
        "memory-total_size" => Some(|op, value| Condition::Memory { op, value }),
        "disk-total_size" => Some(|op, value| Condition::DiskSpace { op, value }),
        "numa-node_number" => Some(|op, value| Condition::NumaNodeCount { op, value }),
        _ => None,
    }
}

fn push_term(conditions: &mut Vec<Condition>, ctor: ConditionCtor, term: &Term) {
    match term {
        Term::Value(Value::StrList(items)) => {
            let group = items
                .iter()
                .map(|item| ctor("=".to_string(), item.clone()))
                .collect();
            conditions.push(Condition::Or(ConditionGroup { conditions: group }));
        }
        Term::Value(v) => conditions.push(ctor("=".to_string(), v.to_string())),
        Term::Ops(ops) => {
            for (op, v) in ops {
                match v {
                    Value::StrList(items) if *op == Op::In => {
                        let group = items
                            .iter()
                            .map(|item| ctor("=".to_string(), item.clone()))
                            .collect();
                        conditions.push(Condition::Or(ConditionGroup { conditions: group }));
                    }
                    v => conditions.push(ctor(op_symbol(*op).to_string(), v.to_string())),
                }
            }
        }
    }
}

/// Convert a sanitised query into the lab service's job XML. One recipe per
/// requested machine; every recipe carries the same host requirements.
pub fn job_xml(query: &Query, count: usize, group: &str) -> Result<String, ProvisionError> {
    let mut conditions = Vec::new();
    for (field, term) in query.iter() {
        if let Some(ctor) = condition_ctor(field) {
            push_term(&mut conditions, ctor, term);
        }
    }
    // Flags expand to one condition each: the host must have all of them.
    if let Some(term) = query.get("cpu-flags") {
        let flags: Vec<String> = match term {
            Term::Value(Value::StrList(flags)) => flags.clone(),
            Term::Value(Value::Str(flag)) => vec![flag.clone()],
            _ => Vec::new(),
        };
        for flag in flags {
            conditions.push(Condition::CpuFlag {
                op: "=".to_string(),
                value: flag,
            });
        }
    }

    let whiteboard = query
        .plain_str("whiteboard")
        .unwrap_or("hostpool-auto")
        .to_string();
    let recipe = RecipeDefinition {
        whiteboard: whiteboard.clone(),
        host_requires: HostRequires {
            and: ConditionGroup { conditions },
        },
    };
    let job = JobDefinition {
        group: group.to_string(),
        whiteboard,
        recipe_set: RecipeSetDefinition {
            recipe: vec![recipe; count.max(1)],
        },
    };
    quick_xml::se::to_string(&job).map_err(|e| ProvisionError::Submit(e.to_string()))
}

// ── Job results ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JobResults {
    #[serde(rename = "recipeSet", default)]
    pub recipe_sets: Vec<RecipeSetResults>,
}

#[derive(Debug, Deserialize)]
pub struct RecipeSetResults {
    #[serde(rename = "recipe", default)]
    pub recipes: Vec<RecipeResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeResult {
    #[serde(rename = "@status", default)]
    pub status: String,
    #[serde(rename = "@result", default)]
    pub result: String,
    #[serde(rename = "@system", default)]
    pub system: String,
    #[serde(rename = "@arch", default)]
    pub arch: String,
    #[serde(rename = "@start_time", default)]
    pub start_time: String,
}

impl JobResults {
    pub fn parse(xml: &str) -> Result<JobResults, ProvisionError> {
        quick_xml::de::from_str(xml).map_err(|e| ProvisionError::External(e.to_string()))
    }

    pub fn recipes(&self) -> Vec<&RecipeResult> {
        self.recipe_sets
            .iter()
            .flat_map(|set| set.recipes.iter())
            .collect()
    }

    /// A terminal failure reason, when one exists.
    pub fn failure(&self) -> Option<String> {
        let recipes = self.recipes();
        if recipes.is_empty() {
            return Some("job results contain no recipes".to_string());
        }
        if recipes
            .iter()
            .any(|r| matches!(r.result.as_str(), "Warn" | "Fail" | "Panic"))
        {
            return Some("job ended with Warn, Fail or Panic".to_string());
        }
        if recipes.iter().any(|r| r.status == "Aborted") {
            return Some("job aborted".to_string());
        }
        None
    }

    pub fn finished(&self) -> bool {
        let recipes = self.recipes();
        !recipes.is_empty()
            && recipes
                .iter()
                .all(|r| r.status == "Completed" && r.result == "Pass")
    }
}
