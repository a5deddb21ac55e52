//! Configuração do baton carregada a partir de `baton.toml`.
//!
//! A struct [`BatonConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `BATON_CHECKPOINT_DIR` tem precedência sobre o arquivo.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::{validate_agent_name, Agent, AgentSettings, ClaudeAgent, CodexAgent, Registry};
use crate::error::{BatonError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimitCoordinator};
use crate::steps::{default_workflow, Roles};
use crate::workflow::{CheckpointStore, TransitionRule, WorkflowDefinition, DEFAULT_MAX_TRANSITIONS};

/// Nome do arquivo procurado no diretório atual.
pub const CONFIG_FILE: &str = "baton.toml";

/// Variável de ambiente que sobrescreve `checkpoint_dir`.
pub const CHECKPOINT_DIR_ENV: &str = "BATON_CHECKPOINT_DIR";

/// Configuração de nível superior carregada de `baton.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatonConfig {
    /// Diretório onde os checkpoints das execuções são gravados.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    /// Máximo de agentes revisores executando ao mesmo tempo.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Limite de transições por execução, contra laços fix ↔ implement.
    #[serde(default = "default_max_transitions")]
    pub max_transitions: usize,

    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// Agentes disponíveis, indexados pelo nome.
    #[serde(default = "default_agents")]
    pub agents: BTreeMap<String, AgentConfig>,

    #[serde(default)]
    pub workflow: WorkflowSection,
}

/// Parâmetros do coordenador de rate limit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitSection {
    /// Esperas registradas antes de desistir do provedor.
    #[serde(default = "default_max_waits")]
    pub max_waits: u32,

    /// Fração máxima de jitter aleatório somada a cada espera.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Espera assumida quando a mensagem não informa o reset.
    #[serde(default = "default_reset_secs")]
    pub default_reset_secs: u64,
}

/// Ferramenta externa por trás de um agente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
}

/// Configuração de um agente em `[agents.<nome>]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub kind: AgentKind,

    /// Executável; o padrão depende de `kind`.
    #[serde(default)]
    pub command: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub effort: Option<String>,

    #[serde(default)]
    pub allowed_tools: Vec<String>,

    /// Provedor compartilhado para fins de rate limit; o padrão é o próprio agente.
    #[serde(default)]
    pub provider: Option<String>,

    /// Prazo de cada invocação, em segundos.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl AgentConfig {
    fn of_kind(kind: AgentKind) -> Self {
        Self {
            kind,
            command: None,
            model: None,
            effort: None,
            allowed_tools: Vec::new(),
            provider: None,
            timeout_secs: None,
        }
    }
}

/// Papéis do workflow e sobrescritas da tabela de transições.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSection {
    #[serde(default = "default_agent_name")]
    pub implementer: String,

    #[serde(default = "default_reviewers")]
    pub reviewers: Vec<String>,

    #[serde(default = "default_agent_name")]
    pub fixer: String,

    #[serde(default = "default_agent_name")]
    pub pr_agent: String,

    /// Linhas `{from, on, to}` que substituem ou completam a tabela padrão.
    #[serde(default)]
    pub transitions: Vec<TransitionRule>,
}

// Valor padrão para o diretório de checkpoints: ".baton/checkpoints".
fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".baton/checkpoints")
}

// Valor padrão para a concorrência: 3.
fn default_concurrency() -> usize {
    3
}

fn default_max_transitions() -> usize {
    DEFAULT_MAX_TRANSITIONS
}

// Valor padrão para esperas máximas: 5.
fn default_max_waits() -> u32 {
    5
}

fn default_jitter_fraction() -> f64 {
    0.1
}

// Valor padrão para o reset sem dica: 60s.
fn default_reset_secs() -> u64 {
    60
}

fn default_agent_name() -> String {
    "claude".to_string()
}

fn default_reviewers() -> Vec<String> {
    vec![default_agent_name()]
}

// Agentes padrão: um de cada tipo, com o nome do tipo.
fn default_agents() -> BTreeMap<String, AgentConfig> {
    BTreeMap::from([
        ("claude".to_string(), AgentConfig::of_kind(AgentKind::Claude)),
        ("codex".to_string(), AgentConfig::of_kind(AgentKind::Codex)),
    ])
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_waits: default_max_waits(),
            jitter_fraction: default_jitter_fraction(),
            default_reset_secs: default_reset_secs(),
        }
    }
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            implementer: default_agent_name(),
            reviewers: default_reviewers(),
            fixer: default_agent_name(),
            pr_agent: default_agent_name(),
            transitions: Vec::new(),
        }
    }
}

impl Default for BatonConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            concurrency: default_concurrency(),
            max_transitions: default_max_transitions(),
            rate_limit: RateLimitSection::default(),
            agents: default_agents(),
            workflow: WorkflowSection::default(),
        }
    }
}

impl BatonConfig {
    /// Carrega a configuração de `path`, ou de `baton.toml` no diretório atual.
    /// Sem caminho explícito, usa valores padrão se o arquivo não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        config.apply_env_override(std::env::var(CHECKPOINT_DIR_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BatonError::Config(format!("cannot read {}: {e}", path.display())))?;
        Ok(toml::from_str(&contents)?)
    }

    /// Interpreta e valida um documento TOML.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_override(&mut self, checkpoint_dir: Option<String>) {
        if let Some(dir) = checkpoint_dir
            && !dir.is_empty()
        {
            self.checkpoint_dir = PathBuf::from(dir);
        }
    }

    /// Verifica nomes de agentes, limites numéricos e papéis do workflow.
    pub fn validate(&self) -> Result<()> {
        for name in self.agents.keys() {
            validate_agent_name(name)?;
        }
        if self.concurrency == 0 {
            return Err(BatonError::Config("concurrency must be at least 1".into()));
        }
        if self.max_transitions == 0 {
            return Err(BatonError::Config("max_transitions must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.rate_limit.jitter_fraction) {
            return Err(BatonError::Config(
                "rate_limit.jitter_fraction must be between 0 and 1".into(),
            ));
        }
        if self.workflow.reviewers.is_empty() {
            return Err(BatonError::Config("workflow.reviewers must not be empty".into()));
        }
        let roles = self.roles();
        let named = [&roles.implementer, &roles.fixer, &roles.pr_agent]
            .into_iter()
            .chain(&roles.reviewers);
        for name in named {
            if !self.agents.contains_key(name) {
                return Err(BatonError::UnknownAgent(name.clone()));
            }
        }
        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_waits: self.rate_limit.max_waits,
            jitter_fraction: self.rate_limit.jitter_fraction,
        }
    }

    /// Coordenador com o mapeamento agente → provedor já aplicado.
    pub fn coordinator(&self) -> RateLimitCoordinator {
        self.agents
            .iter()
            .filter_map(|(name, agent)| agent.provider.as_ref().map(|p| (name, p)))
            .fold(
                RateLimitCoordinator::new(self.rate_limit_config()),
                |coordinator, (name, provider)| coordinator.map_agent(name.clone(), provider.clone()),
            )
    }

    /// Constrói um adaptador para cada agente configurado.
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        for (name, agent) in &self.agents {
            let settings = AgentSettings {
                command: agent.command.clone().unwrap_or_default(),
                model: agent.model.clone(),
                effort: agent.effort.clone(),
                allowed_tools: agent.allowed_tools.clone(),
                default_reset: Some(Duration::from_secs(self.rate_limit.default_reset_secs)),
            };
            let adapter: Arc<dyn Agent> = match agent.kind {
                AgentKind::Claude => Arc::new(ClaudeAgent::new(name.clone(), settings)),
                AgentKind::Codex => Arc::new(CodexAgent::new(name.clone(), settings)),
            };
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    pub fn timeouts(&self) -> HashMap<String, Duration> {
        self.agents
            .iter()
            .filter_map(|(name, agent)| {
                agent
                    .timeout_secs
                    .map(|secs| (name.clone(), Duration::from_secs(secs)))
            })
            .collect()
    }

    pub fn roles(&self) -> Roles {
        Roles {
            implementer: self.workflow.implementer.clone(),
            reviewers: self.workflow.reviewers.clone(),
            fixer: self.workflow.fixer.clone(),
            pr_agent: self.workflow.pr_agent.clone(),
        }
    }

    /// Agentes usados pelo workflow, sem repetição.
    pub fn workflow_agents(&self) -> Vec<String> {
        let roles = self.roles();
        let mut names: Vec<String> = [roles.implementer, roles.fixer, roles.pr_agent]
            .into_iter()
            .chain(roles.reviewers)
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn workflow(&self) -> WorkflowDefinition {
        default_workflow(&self.workflow.transitions)
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.checkpoint_dir)
    }
}
