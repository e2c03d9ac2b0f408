use super::{quote_path, ScriptContext, ScriptSpec, ScriptWriter};
use crate::config::PipelineConfig;
use std::path::Path;

/// Plain shell scripts without scheduler directives, run directly with `sh`
#[derive(Debug, Clone)]
pub struct ShellWriter {
    trace: bool,
}

impl ShellWriter {
    pub fn load(config: &PipelineConfig) -> Self {
        Self {
            trace: config.general.debug_level > 0,
        }
    }
}

impl ScriptWriter for ShellWriter {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn render_header(&self, _spec: &ScriptSpec, _ctx: &ScriptContext) -> String {
        "#!/bin/sh\n".to_owned()
    }

    fn invocation(&self, script: &Path, _ctx: &ScriptContext) -> String {
        if self.trace {
            format!("sh -x {}", quote_path(script))
        } else {
            format!("sh {}", quote_path(script))
        }
    }
}
