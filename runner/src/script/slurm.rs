use super::{quote_path, ScriptContext, ScriptSpec, ScriptWriter};
use crate::config::{BatchConfig, ConfigErrors, PipelineConfig};
use std::{fmt::Write as _, path::Path};

/// Scripts for Slurm, submitted with `sbatch`
#[derive(Debug, Clone)]
pub struct SlurmWriter {
    resources: BatchConfig,
}

impl SlurmWriter {
    pub fn load(config: &PipelineConfig) -> Result<Self, ConfigErrors> {
        config
            .batch("slurm")
            .cloned()
            .map(|resources| Self { resources })
            .ok_or_else(|| ConfigErrors::MissingSection("slurm".to_owned()))
    }
}

impl ScriptWriter for SlurmWriter {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn render_header(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let resources = &self.resources;
        let log = ctx
            .paths
            .log_dir()
            .join(format!("{}.out", spec.unit().local_name()));
        let mut header = String::from("#!/bin/sh\n");

        let _ = writeln!(header, "#SBATCH --job-name={}", resources.job_name);
        if let Some(ref email) = resources.email {
            let _ = writeln!(header, "#SBATCH --mail-user={email}\n#SBATCH --mail-type=FAIL");
        }
        let _ = writeln!(header, "#SBATCH --output={}", quote_path(&log));
        let _ = writeln!(header, "#SBATCH --time={}", resources.walltime);
        let _ = writeln!(header, "#SBATCH --nodes={}", resources.nodes);
        let _ = writeln!(header, "#SBATCH --ntasks-per-node={}", resources.cores_per_node);
        if let Some(memory) = resources.memory_mb {
            let _ = writeln!(header, "#SBATCH --mem-per-cpu={memory}M");
        }
        if let Some(ref queue) = resources.queue {
            let _ = writeln!(header, "#SBATCH --partition={queue}");
        }
        if let Some(ref account) = resources.account {
            let _ = writeln!(header, "#SBATCH --account={account}");
        }

        header
    }

    fn invocation(&self, script: &Path, _ctx: &ScriptContext) -> String {
        format!("sbatch {}", quote_path(script))
    }
}
