//! Built-in capability pack: the local services and connector tools the
//! kernel ships with. Leaf capabilities stay deliberately small; the kernel
//! records whatever they produce and treats them like any externally
//! registered pack.

use futures::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;

use crate::errors::{ErrorKind, KernelError, KernelResult};
use crate::mcp::{ChainRequest, McpRuntime, ToolDescriptor, ToolResponse};
use crate::registry::{
    Acceptance, CapabilityContract, DecisionGate, ExecutionMode, GateAction, GateCondition,
    ServiceDescriptor, ServiceInvocation, ServiceOutput, ServiceRegistry, StrategyDescriptor,
};
use crate::store::StateStore;
use crate::types::{ArtifactKind, Maturity, ParamSpec, RiskLevel, TaskKind};

fn text_param(invocation: &ServiceInvocation) -> String {
    invocation
        .params
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn advisor_contract(inputs: Vec<ParamSpec>, outputs: Vec<ArtifactKind>) -> CapabilityContract {
    CapabilityContract {
        inputs,
        decision_gates: vec![],
        execution_mode: ExecutionMode::Advisor,
        fallback: None,
        outputs,
        acceptance: vec![Acceptance::ArtifactProduced { kind: None }],
        side_effects: vec![],
    }
}

/// Register the built-in services, strategies and connector tools.
pub fn register_builtins(
    registry: &ServiceRegistry,
    store: &Arc<StateStore>,
    mcp: &Arc<McpRuntime>,
) -> KernelResult<()> {
    register_deck_outline(registry, store)?;
    register_research_brief(registry, store)?;
    register_data_answer(registry, store)?;
    register_generalist(registry, store)?;
    register_publish_site(registry, store)?;
    register_connector_tools(mcp)?;
    register_connector_services(registry, store, mcp)?;
    register_strategies(registry)?;
    Ok(())
}

fn register_deck_outline(registry: &ServiceRegistry, store: &Arc<StateStore>) -> KernelResult<()> {
    let store = Arc::clone(store);
    let contract = CapabilityContract {
        inputs: vec![
            ParamSpec::required("text"),
            ParamSpec::optional("title"),
            ParamSpec {
                description: "Who the deck is for; shapes tone and depth.".into(),
                ..ParamSpec::optional("audience")
                    .with_default(json!("executive team"))
                    .high_value("Who is the audience for this deck?")
            },
        ],
        decision_gates: vec![],
        execution_mode: ExecutionMode::Advisor,
        fallback: Some("svc.generalist.respond".into()),
        outputs: vec![ArtifactKind::Md, ArtifactKind::Json],
        acceptance: vec![
            Acceptance::ArtifactProduced {
                kind: Some(ArtifactKind::Md),
            },
            Acceptance::ArtifactCountAtLeast { count: 2 },
        ],
        side_effects: vec![],
    };

    registry.register_service(
        ServiceDescriptor {
            name: "svc.deck.outline".into(),
            version: "1.1.0".into(),
            description: "Structured review/deck outline from a one-line brief".into(),
            layer: "capability".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            contract,
            lint_problems: vec![],
        },
        Arc::new(move |invocation: ServiceInvocation| -> BoxFuture<'static, KernelResult<ServiceOutput>> {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let text = text_param(&invocation);
                let title = invocation
                    .params
                    .get("title")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| text.chars().take(48).collect());
                let audience = invocation
                    .params
                    .get("audience")
                    .and_then(|v| v.as_str())
                    .unwrap_or("executive team")
                    .to_string();

                let sections = [
                    "Context and goal",
                    "What happened",
                    "What worked / what did not",
                    "Root causes",
                    "Next-quarter actions",
                ];
                let mut md = format!("# {}\n\n_Audience: {}_\n\n", title, audience);
                for (i, section) in sections.iter().enumerate() {
                    md.push_str(&format!("## {}. {}\n\n- …\n\n", i + 1, section));
                }
                let outline = json!({
                    "title": title,
                    "audience": audience,
                    "sections": sections,
                    "source_text": text,
                });

                let produced_by = "deck.outline".to_string();
                let md_ref = store
                    .artifacts()
                    .put(md.as_bytes(), ArtifactKind::Md, &produced_by)?;
                let json_ref = store.artifacts().put(
                    serde_json::to_vec_pretty(&outline)?.as_slice(),
                    ArtifactKind::Json,
                    &produced_by,
                )?;

                Ok(ServiceOutput {
                    value: json!({"title": outline["title"], "sections": sections.len()}),
                    artifacts: vec![md_ref, json_ref],
                    assumptions: vec![],
                    advisory: false,
                    retries: 0,
                    tool_fallbacks: 0,
                })
            })
        }),
    )
}

fn register_research_brief(
    registry: &ServiceRegistry,
    store: &Arc<StateStore>,
) -> KernelResult<()> {
    let store = Arc::clone(store);
    registry.register_service(
        ServiceDescriptor {
            name: "svc.research.brief".into(),
            version: "1.0.0".into(),
            description: "One-page research brief assembled from the task text".into(),
            layer: "capability".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            contract: advisor_contract(
                vec![ParamSpec::required("text"), ParamSpec::optional("url")],
                vec![ArtifactKind::Md],
            ),
            lint_problems: vec![],
        },
        Arc::new(move |invocation| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let text = text_param(&invocation);
                let md = format!(
                    "# Research brief\n\n**Question**\n\n{}\n\n**Key angles**\n\n- scope and definitions\n- current signals\n- open risks\n",
                    text
                );
                let md_ref = store.artifacts().put(
                    md.as_bytes(),
                    ArtifactKind::Md,
                    &"research.brief".to_string(),
                )?;
                Ok(ServiceOutput {
                    value: json!({"length": md.len()}),
                    artifacts: vec![md_ref],
                    ..Default::default()
                })
            })
        }),
    )
}

fn register_data_answer(registry: &ServiceRegistry, store: &Arc<StateStore>) -> KernelResult<()> {
    let store = Arc::clone(store);
    registry.register_service(
        ServiceDescriptor {
            name: "svc.data.answer".into(),
            version: "0.3.0".into(),
            description: "Query plan and answer sheet for a data question".into(),
            layer: "capability".into(),
            maturity: Maturity::Beta,
            risk_level: RiskLevel::Low,
            contract: CapabilityContract {
                inputs: vec![
                    ParamSpec::required("text"),
                    ParamSpec::required("dataset")
                        .high_value("Which dataset or table should the query run against?"),
                ],
                decision_gates: vec![],
                execution_mode: ExecutionMode::Advisor,
                fallback: Some("svc.generalist.respond".into()),
                outputs: vec![ArtifactKind::Json],
                acceptance: vec![Acceptance::ArtifactProduced {
                    kind: Some(ArtifactKind::Json),
                }],
                side_effects: vec![],
            },
            lint_problems: vec![],
        },
        Arc::new(move |invocation| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let dataset = invocation
                    .params
                    .get("dataset")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let plan = json!({
                    "dataset": dataset,
                    "question": text_param(&invocation),
                    "steps": ["resolve schema", "build aggregation", "render answer"],
                });
                let json_ref = store.artifacts().put(
                    serde_json::to_vec_pretty(&plan)?.as_slice(),
                    ArtifactKind::Json,
                    &"data.answer".to_string(),
                )?;
                Ok(ServiceOutput {
                    value: plan,
                    artifacts: vec![json_ref],
                    ..Default::default()
                })
            })
        }),
    )
}

fn register_generalist(registry: &ServiceRegistry, store: &Arc<StateStore>) -> KernelResult<()> {
    let store = Arc::clone(store);
    registry.register_service(
        ServiceDescriptor {
            name: "svc.generalist.respond".into(),
            version: "1.0.0".into(),
            description: "Generalist responder for tasks no specialist claims".into(),
            layer: "generalist".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Low,
            contract: advisor_contract(vec![ParamSpec::required("text")], vec![ArtifactKind::Md]),
            lint_problems: vec![],
        },
        Arc::new(move |invocation| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let md = format!("# Response\n\n{}\n", text_param(&invocation));
                let md_ref = store.artifacts().put(
                    md.as_bytes(),
                    ArtifactKind::Md,
                    &"generalist.respond".to_string(),
                )?;
                Ok(ServiceOutput {
                    value: json!({"ok": true}),
                    artifacts: vec![md_ref],
                    ..Default::default()
                })
            })
        }),
    )
}

fn register_publish_site(registry: &ServiceRegistry, store: &Arc<StateStore>) -> KernelResult<()> {
    let store = Arc::clone(store);
    registry.register_service(
        ServiceDescriptor {
            name: "svc.publish.site".into(),
            version: "0.9.0".into(),
            description: "Render and publish a static page for a finished result".into(),
            layer: "capability".into(),
            maturity: Maturity::Stable,
            risk_level: RiskLevel::Medium,
            contract: CapabilityContract {
                inputs: vec![
                    ParamSpec::required("text"),
                    ParamSpec::optional("target").with_default(json!("local-preview")),
                ],
                decision_gates: vec![DecisionGate {
                    name: "production-target".into(),
                    condition: GateCondition::ParamMatches {
                        param: "target".into(),
                        pattern: "^prod".into(),
                    },
                    action: GateAction::Escalate,
                }],
                execution_mode: ExecutionMode::Operator,
                fallback: None,
                outputs: vec![ArtifactKind::Html],
                acceptance: vec![Acceptance::ArtifactProduced {
                    kind: Some(ArtifactKind::Html),
                }],
                side_effects: vec!["publish".into()],
            },
            lint_problems: vec![],
        },
        Arc::new(move |invocation| {
            let store = Arc::clone(&store);
            Box::pin(async move {
                let html = format!(
                    "<!doctype html>\n<html><body><main>{}</main></body></html>\n",
                    text_param(&invocation)
                );
                let html_ref = store.artifacts().put(
                    html.as_bytes(),
                    ArtifactKind::Html,
                    &"publish.site".to_string(),
                )?;
                Ok(ServiceOutput {
                    value: json!({"published_to": invocation.params.get("target")}),
                    artifacts: vec![html_ref],
                    ..Default::default()
                })
            })
        }),
    )
}

/// Default in-process connector tools. Real deployments replace these with
/// command-backed catalog entries from the config file.
fn register_connector_tools(mcp: &Arc<McpRuntime>) -> KernelResult<()> {
    mcp.register_in_process(
        ToolDescriptor {
            server: "web".into(),
            tool: "fetch".into(),
            keywords: vec!["fetch".into(), "url".into(), "http".into(), "抓取".into()],
            cost: 0.2,
            command: None,
        },
        Arc::new(|request| {
            Box::pin(async move {
                let url = request
                    .params
                    .get("url")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        KernelError::attempt(ErrorKind::MissingInput, "fetch requires 'url'")
                    })?;
                Ok(ToolResponse {
                    value: json!({"url": url, "fetched": true, "summary": format!("content of {}", url)}),
                    artifacts: vec![],
                    partial: false,
                })
            })
        }),
    )?;

    mcp.register_in_process(
        ToolDescriptor {
            server: "web".into(),
            tool: "search".into(),
            keywords: vec!["search".into(), "find".into(), "摘要".into(), "查".into()],
            cost: 0.1,
            command: None,
        },
        Arc::new(|request| {
            Box::pin(async move {
                let query = request
                    .params
                    .get("query")
                    .or_else(|| request.params.get("url"))
                    .cloned()
                    .unwrap_or(json!(""));
                Ok(ToolResponse {
                    value: json!({"query": query, "results": ["r1", "r2", "r3"]}),
                    artifacts: vec![],
                    partial: false,
                })
            })
        }),
    )
}

/// Connector-backed services: uniform service surface over MCP chains, so
/// the engine invokes them exactly like local capabilities.
fn register_connector_services(
    registry: &ServiceRegistry,
    store: &Arc<StateStore>,
    mcp: &Arc<McpRuntime>,
) -> KernelResult<()> {
    for (name, produced_by, maturity, risk, keywords) in [
        (
            "mcp.web.fetch",
            "web.fetch",
            Maturity::Beta,
            RiskLevel::Medium,
            "fetch url http 抓取",
        ),
        (
            "mcp.web.search",
            "web.search",
            Maturity::Stable,
            RiskLevel::Low,
            "search find summarize 摘要",
        ),
    ] {
        let store = Arc::clone(store);
        let mcp = Arc::clone(mcp);
        let produced_by = produced_by.to_string();
        let intent_hint = keywords.to_string();

        registry.register_service(
            ServiceDescriptor {
                name: name.into(),
                version: "1.0.0".into(),
                description: format!("Connector chain for '{}' intents", produced_by),
                layer: "connector".into(),
                maturity,
                risk_level: risk,
                contract: advisor_contract(
                    vec![ParamSpec::required("text"), ParamSpec::optional("url")],
                    vec![ArtifactKind::Json],
                ),
                lint_problems: vec![],
            },
            Arc::new(move |invocation: ServiceInvocation| {
                let store = Arc::clone(&store);
                let mcp = Arc::clone(&mcp);
                let produced_by = produced_by.clone();
                let intent_hint = intent_hint.clone();
                Box::pin(async move {
                    let text = text_param(&invocation);
                    let url = invocation.params.get("url").cloned().or_else(|| {
                        extract_url(&text).map(serde_json::Value::String)
                    });
                    let mut chain_params = serde_json::Map::new();
                    chain_params.insert("query".into(), json!(text));
                    if let Some(url) = url {
                        chain_params.insert("url".into(), url);
                    }

                    let outcome = mcp
                        .execute(
                            ChainRequest {
                                intent: format!("{} {}", text, intent_hint),
                                params: serde_json::Value::Object(chain_params),
                                run_id: invocation.run_id.clone(),
                                step_id: invocation.service.clone(),
                                dry_run: invocation.dry_run,
                                deterministic: false,
                            },
                            None,
                        )
                        .await;

                    let response = outcome.result?;
                    let json_ref = store.artifacts().put(
                        serde_json::to_vec_pretty(&response.value)?.as_slice(),
                        ArtifactKind::Json,
                        &produced_by,
                    )?;
                    Ok(ServiceOutput {
                        value: response.value,
                        artifacts: vec![json_ref],
                        assumptions: vec![],
                        advisory: response.partial,
                        retries: outcome.retries,
                        tool_fallbacks: outcome.fallbacks,
                    })
                })
            }),
        )?;
    }
    Ok(())
}

fn extract_url(text: &str) -> Option<String> {
    text.split_whitespace()
        .find(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| w.trim_end_matches(['，', '。', ',', '.']).to_string())
}

fn register_strategies(registry: &ServiceRegistry) -> KernelResult<()> {
    let strategies = vec![
        StrategyDescriptor {
            strategy_id: "deck.outline".into(),
            service: "svc.deck.outline".into(),
            task_kinds: vec![TaskKind::Presentation],
            keywords: vec![
                "deck".into(),
                "slide".into(),
                "框架".into(),
                "复盘".into(),
                "汇报".into(),
            ],
        },
        StrategyDescriptor {
            strategy_id: "research.brief".into(),
            service: "svc.research.brief".into(),
            task_kinds: vec![TaskKind::Research],
            keywords: vec!["research".into(), "调研".into(), "分析".into()],
        },
        StrategyDescriptor {
            strategy_id: "data.answer".into(),
            service: "svc.data.answer".into(),
            task_kinds: vec![TaskKind::DataQuery],
            keywords: vec!["query".into(), "数据".into(), "统计".into(), "sql".into()],
        },
        StrategyDescriptor {
            strategy_id: "web.fetch".into(),
            service: "mcp.web.fetch".into(),
            task_kinds: vec![TaskKind::Research, TaskKind::Automation],
            keywords: vec!["http".into(), "抓取".into(), "fetch".into(), "url".into()],
        },
        StrategyDescriptor {
            strategy_id: "web.search".into(),
            service: "mcp.web.search".into(),
            task_kinds: vec![TaskKind::Research, TaskKind::Automation],
            keywords: vec!["search".into(), "摘要".into(), "summarize".into()],
        },
        StrategyDescriptor {
            strategy_id: "publish.site".into(),
            service: "svc.publish.site".into(),
            task_kinds: vec![TaskKind::Automation],
            keywords: vec!["publish".into(), "发布".into(), "site".into()],
        },
        StrategyDescriptor {
            strategy_id: "generalist.respond".into(),
            service: "svc.generalist.respond".into(),
            task_kinds: vec![
                TaskKind::Presentation,
                TaskKind::Research,
                TaskKind::DataQuery,
                TaskKind::Image,
                TaskKind::Automation,
                TaskKind::Other,
            ],
            keywords: vec![],
        },
    ];
    for strategy in strategies {
        registry.register_strategy(strategy)?;
    }
    Ok(())
}
