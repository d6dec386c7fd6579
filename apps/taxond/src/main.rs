use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use taxon_judge::{CommandJudge, OfflineJudge, ScriptedJudge};
use taxon_kernel::{KernelBuilder, TaxonKernel, UnitDraft};
use taxon_protocol::{
    AlternativeId, AssessmentKind, CONCEPT, FieldKind, FieldSpec, GapKind, Grade, JudgePort,
    JudgeReply, JudgeVerdict, MigrationId, OperationId, OperationKind, ProjectId,
    ProposedOperation, Severity, SignalType, Tier, TypeDefId, TypeDefinition,
};
use taxon_runtime::RuntimeConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taxond")]
#[command(about = "Taxonomy evolution engine")]
struct Cli {
    #[arg(long, default_value = ".taxon")]
    root: PathBuf,
    /// JSON document overriding the runtime configuration. `--root` wins
    /// over any root it names.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Oracle command. Each request is written to its stdin as JSON.
    #[arg(long)]
    judge: Option<String>,
    #[arg(long = "judge-arg", allow_hyphen_values = true)]
    judge_args: Vec<String>,
    #[arg(long, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a project seeded from doctrine.
    CreateProject { project: String },
    /// Add a unit from a JSON draft, e.g.
    /// '{"type_name":"Concept","domain":"markets","fields":{"name":"Rates"}}'.
    AddUnit { project: String, draft: String },
    /// List the live types of a project.
    Types { project: String },
    /// Run one detection cycle.
    Cycle { project: String },
    /// List open decisions.
    Pending { project: String },
    /// Choose an alternative of an open decision.
    Resolve {
        project: String,
        operation: String,
        #[arg(long, default_value = "proposed")]
        alternative: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Withdraw an open decision.
    Withdraw {
        project: String,
        operation: String,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Undo an applied migration.
    Revert { project: String, migration: String },
    /// Apply a reverted migration again.
    Reapply { project: String, migration: String },
    /// Print a project's ledger.
    Ledger { project: String },
    /// Walk a split scenario end to end against an in-memory kernel and a
    /// scripted oracle.
    Demo,
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed reading config {}", path.display()))?;
            RuntimeConfig::from_json(&raw)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => RuntimeConfig::default(),
    };
    config.root = cli.root.clone();
    Ok(config)
}

fn oracle(cli: &Cli) -> Arc<dyn JudgePort> {
    match &cli.judge {
        Some(program) => Arc::new(CommandJudge::new(program.clone(), cli.judge_args.clone())),
        None => {
            warn!("no oracle command configured, assessments will report unavailable");
            Arc::new(OfflineJudge)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .compact()
        .with_writer(std::io::stderr)
        .init();

    if matches!(cli.command, Command::Demo) {
        return demo().await;
    }

    let config = load_config(&cli).await?;
    let kernel = KernelBuilder::new(&cli.root)
        .config(config)
        .judge(oracle(&cli))
        .open()
        .await?;

    match cli.command {
        Command::CreateProject { project } => {
            let project_id = kernel.create_project(&project).await?;
            print(&kernel.state(&project_id).await?.to_snapshot())?;
        }
        Command::AddUnit { project, draft } => {
            let draft: UnitDraft =
                serde_json::from_str(&draft).context("unit draft is not valid JSON")?;
            let unit = kernel
                .add_unit(&ProjectId::from_string(project), draft)
                .await?;
            print(&unit)?;
        }
        Command::Types { project } => {
            print(&kernel.list_types(&ProjectId::from_string(project)).await?)?;
        }
        Command::Cycle { project } => {
            let report = kernel
                .run_detection_cycle(&ProjectId::from_string(project))
                .await?;
            print(&report)?;
        }
        Command::Pending { project } => {
            print(&kernel.list_pending(&ProjectId::from_string(project)).await?)?;
        }
        Command::Resolve {
            project,
            operation,
            alternative,
            actor,
        } => {
            let resolution = kernel
                .resolve(
                    &ProjectId::from_string(project),
                    &OperationId::from_string(operation),
                    &AlternativeId::from_string(alternative),
                    &actor,
                )
                .await?;
            print(&resolution)?;
        }
        Command::Withdraw {
            project,
            operation,
            actor,
        } => {
            let resolution = kernel
                .withdraw(
                    &ProjectId::from_string(project),
                    &OperationId::from_string(operation),
                    &actor,
                )
                .await?;
            print(&resolution)?;
        }
        Command::Revert { project, migration } => {
            let record = kernel
                .revert(
                    &ProjectId::from_string(project),
                    &MigrationId::from_string(migration),
                )
                .await?;
            print(&record)?;
        }
        Command::Reapply { project, migration } => {
            let record = kernel
                .reapply(
                    &ProjectId::from_string(project),
                    &MigrationId::from_string(migration),
                )
                .await?;
            print(&record)?;
        }
        Command::Ledger { project } => {
            print(&kernel.ledger(&ProjectId::from_string(project)).await?)?;
        }
        Command::Demo => {}
    }
    Ok(())
}

async fn demo() -> Result<()> {
    let judge = Arc::new(ScriptedJudge::new());
    let kernel = KernelBuilder::new(".taxon-demo")
        .judge(judge.clone())
        .in_memory()
        .build();

    let mut records = kernel.subscribe_all();
    let ledger_task = tokio::spawn(async move {
        while let Ok(record) = records.recv().await {
            let rendered = serde_json::to_string(&record.kind).unwrap_or_else(|_| "{}".to_owned());
            info!(project_id = %record.project_id, sequence = record.sequence, entry = %rendered, "ledger.appended");
        }
    });

    let project = kernel.create_project("markets").await?;
    let market = TypeDefId::from("market_force");
    kernel
        .define_type(
            &project,
            TypeDefinition::new(
                market.clone(),
                Tier::Domain,
                Some(TypeDefId::from(CONCEPT)),
                "Market Force",
            )
            .with_field(FieldSpec::new("name", FieldKind::Text, &market).required())
            .with_field(FieldSpec::new("definition", FieldKind::LongText, &market)),
        )
        .await?;
    let rates = add_force(&kernel, &project, "Interest rates", "policy rate moves").await?;
    let brand = add_force(&kernel, &project, "Brand loyalty", "repeat buyers").await?;

    let mut friction = JudgeReply::new(
        AssessmentKind::Friction,
        JudgeVerdict::Affirmed,
        "macro and company-level forces share one type",
    )
    .with_grade(Grade::Severity(Severity::High));
    friction.signal_type = Some(SignalType::BimodalContent);
    let mut assignments = BTreeMap::new();
    assignments.insert(rates, "Macro Force".to_owned());
    assignments.insert(brand, "Company Force".to_owned());
    let mut diagnosis = JudgeReply::new(
        AssessmentKind::Diagnosis,
        JudgeVerdict::Affirmed,
        "two concepts under one name",
    )
    .with_operation(ProposedOperation {
        kind: OperationKind::Split,
        source_type_ids: vec![market.clone()],
        target_type_ids: Vec::new(),
        new_type_names: vec!["Macro Force".to_owned(), "Company Force".to_owned()],
        new_alias: None,
        extends: None,
        assignments,
        rationale: "separate macro drivers from firm-level drivers".to_owned(),
    });
    diagnosis.gap_kind = Some(GapKind::WrongConcept);
    judge
        .script_for(AssessmentKind::Friction, &market, friction)
        .script_for(AssessmentKind::Diagnosis, &market, diagnosis);

    let report = kernel.run_detection_cycle(&project).await?;
    info!(
        friction_events = report.friction_events,
        pending = report.pending.len(),
        "cycle complete"
    );

    for decision in kernel.list_pending(&project).await? {
        let resolution = kernel
            .resolve(
                &project,
                &decision.operation.id,
                &AlternativeId::proposed(),
                "demo",
            )
            .await?;
        info!(operation_id = %decision.operation.id, outcome = ?resolution.outcome, "decision resolved");
    }

    for definition in kernel.list_types(&project).await? {
        info!(type_id = %definition.id, name = definition.display_name(), status = ?definition.status, "type");
    }

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    ledger_task.abort();
    if let Err(error) = ledger_task.await
        && !error.is_cancelled()
    {
        warn!(%error, "ledger task stopped");
    }
    Ok(())
}

async fn add_force(
    kernel: &TaxonKernel,
    project: &ProjectId,
    name: &str,
    definition: &str,
) -> Result<taxon_protocol::UnitId> {
    let unit = kernel
        .add_unit(
            project,
            UnitDraft::new("Market Force", "markets")
                .with_field("name", name)
                .with_field("definition", definition),
        )
        .await?;
    Ok(unit.id)
}
