use super::{quote_path, ScriptContext, ScriptSpec, ScriptWriter};
use crate::config::{BatchConfig, ConfigErrors, PipelineConfig};
use std::{fmt::Write as _, path::Path};

/// Scripts for PBS/Torque, submitted with `qsub`
#[derive(Debug, Clone)]
pub struct PbsWriter {
    resources: BatchConfig,
}

impl PbsWriter {
    pub fn load(config: &PipelineConfig) -> Result<Self, ConfigErrors> {
        config
            .batch("pbs")
            .cloned()
            .map(|resources| Self { resources })
            .ok_or_else(|| ConfigErrors::MissingSection("pbs".to_owned()))
    }
}

impl ScriptWriter for PbsWriter {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn render_header(&self, spec: &ScriptSpec, ctx: &ScriptContext) -> String {
        let resources = &self.resources;
        let log = ctx
            .paths
            .log_dir()
            .join(format!("{}.out", spec.unit().local_name()));
        let mut header = String::from("#!/bin/sh\n");

        let _ = writeln!(header, "#PBS -N {}", resources.job_name);
        if let Some(ref email) = resources.email {
            let _ = writeln!(header, "#PBS -M {email}");
        }
        // mail on abort only, join stdout and stderr
        header.push_str("#PBS -m a\n#PBS -j oe\n");
        let _ = writeln!(header, "#PBS -o {}", quote_path(&log));
        let _ = writeln!(header, "#PBS -l walltime={}", resources.walltime);
        let _ = writeln!(
            header,
            "#PBS -l nodes={}:ppn={}",
            resources.nodes, resources.cores_per_node
        );
        if let Some(memory) = resources.memory_mb {
            let _ = writeln!(header, "#PBS -l pmem={memory}MB");
        }
        if let Some(ref queue) = resources.queue {
            let _ = writeln!(header, "#PBS -q {queue}");
        }
        if let Some(ref account) = resources.account {
            let _ = writeln!(header, "#PBS -A {account}");
        }

        header
    }

    fn invocation(&self, script: &Path, _ctx: &ScriptContext) -> String {
        format!("qsub {}", quote_path(script))
    }
}
