use thiserror::Error;

/// Errors raised while driving a cluster node.
///
/// Every node-scoped variant carries the hostname of the node the failure
/// happened on, so callers sweeping the whole cluster can report it without
/// extra bookkeeping.
#[derive(Error, Debug)]
pub enum CxmError {
    /// A local command exited non-zero.
    #[error("Error on {node} : {message}")]
    Shell {
        node: String,
        message: String,
        exitcode: i32,
    },

    /// A command run over the remote execution session exited non-zero.
    #[error("Error on {node} : {message}")]
    Ssh {
        node: String,
        message: String,
        exitcode: i32,
    },

    #[error("Error on {node} : VM {vm} is running.")]
    RunningVm { node: String, vm: String },

    #[error("Error on {node} : VM {vm} is not running here.")]
    NotRunningVm { node: String, vm: String },

    #[error("Error on {node} : There is not enough ram: {details}")]
    NotEnoughRam { node: String, details: String },

    #[error("Error on {node} : {details}")]
    FenceNode { node: String, details: String },

    /// The hypervisor management API rejected a call.
    #[error("Error on {node} : hypervisor call '{operation}' failed: {details}")]
    Hypervisor {
        node: String,
        operation: String,
        details: String,
    },

    /// A command succeeded but printed something that cannot be interpreted.
    #[error("Error on {node} : unexpected output of '{command}': {output}")]
    UnexpectedOutput {
        node: String,
        command: String,
        output: String,
    },

    /// The execution channel or a hypervisor session could not be opened.
    #[error("Error on {node} : connection failed: {details}")]
    Connection { node: String, details: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

pub type CxmResult<T> = std::result::Result<T, CxmError>;

impl CxmError {
    pub fn shell(node: impl Into<String>, message: impl Into<String>, exitcode: i32) -> Self {
        CxmError::Shell {
            node: node.into(),
            message: message.into(),
            exitcode,
        }
    }

    pub fn ssh(node: impl Into<String>, message: impl Into<String>, exitcode: i32) -> Self {
        CxmError::Ssh {
            node: node.into(),
            message: message.into(),
            exitcode,
        }
    }

    pub fn running_vm(node: impl Into<String>, vm: impl Into<String>) -> Self {
        CxmError::RunningVm {
            node: node.into(),
            vm: vm.into(),
        }
    }

    pub fn not_running_vm(node: impl Into<String>, vm: impl Into<String>) -> Self {
        CxmError::NotRunningVm {
            node: node.into(),
            vm: vm.into(),
        }
    }

    pub fn not_enough_ram(node: impl Into<String>, details: impl Into<String>) -> Self {
        CxmError::NotEnoughRam {
            node: node.into(),
            details: details.into(),
        }
    }

    pub fn fence(node: impl Into<String>, details: impl Into<String>) -> Self {
        CxmError::FenceNode {
            node: node.into(),
            details: details.into(),
        }
    }

    pub fn unexpected_output(
        node: impl Into<String>,
        command: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        CxmError::UnexpectedOutput {
            node: node.into(),
            command: command.into(),
            output: output.into(),
        }
    }

    /// Hostname of the node the error happened on, if it is node-scoped.
    pub fn node(&self) -> Option<&str> {
        match self {
            CxmError::Shell { node, .. }
            | CxmError::Ssh { node, .. }
            | CxmError::RunningVm { node, .. }
            | CxmError::NotRunningVm { node, .. }
            | CxmError::NotEnoughRam { node, .. }
            | CxmError::FenceNode { node, .. }
            | CxmError::Hypervisor { node, .. }
            | CxmError::UnexpectedOutput { node, .. }
            | CxmError::Connection { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Exit code reported by a failed shell or remote command.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CxmError::Shell { exitcode, .. } | CxmError::Ssh { exitcode, .. } => Some(*exitcode),
            _ => None,
        }
    }

    /// Captured error text of a failed shell or remote command.
    pub fn shell_message(&self) -> Option<&str> {
        match self {
            CxmError::Shell { message, .. } | CxmError::Ssh { message, .. } => Some(message),
            _ => None,
        }
    }

    /// True for both the local and the remote flavour of a command failure.
    pub fn is_shell_error(&self) -> bool {
        matches!(self, CxmError::Shell { .. } | CxmError::Ssh { .. })
    }
}
