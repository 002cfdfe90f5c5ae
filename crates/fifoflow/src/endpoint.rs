//! Declared FIFO roles held by stages.
//!
//! An [`Endpoint`] names a logical pipe, a direction, and how the runtime
//! hands the pipe to the stage function: managed endpoints are opened and
//! closed around the user code, unmanaged endpoints only receive the raw
//! path, for stages that shell out to an external tool or open the pipe in a
//! non-default way.

use crate::error::{Error, Result};

/// Direction of a stage's participation in a FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Reader,
    Writer,
}

/// Read/write mode of the opened handle. Informational: it documents whether
/// the stream carries text records or opaque bytes (e.g. compressed output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipeMode {
    #[default]
    Text,
    Binary,
}

/// A declared FIFO role: logical name (possibly templated), direction, fan
/// count and management flag.
#[derive(Debug, Clone)]
pub struct Endpoint {
    name: String,
    direction: Direction,
    fan: usize,
    managed: bool,
    mode: PipeMode,
    reopen: u32,
}

impl Endpoint {
    /// Declares a reading role on `name`.
    pub fn reader(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Reader)
    }

    /// Declares a writing role on `name`.
    pub fn writer(name: impl Into<String>) -> Self {
        Self::new(name, Direction::Writer)
    }

    fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            fan: 1,
            managed: true,
            mode: PipeMode::Text,
            reopen: 1,
        }
    }

    /// Expands this endpoint to `n` concrete pipes; the name must then carry
    /// an `{n}` placeholder.
    pub fn fan(mut self, n: usize) -> Self {
        self.fan = n;
        self
    }

    /// Passes the raw path(s) to the stage function instead of open handles.
    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    /// Marks the stream as opaque bytes rather than text records.
    pub fn binary(mut self) -> Self {
        self.mode = PipeMode::Binary;
        self
    }

    /// Declares `k` sequential open/close cycles against each expanded pipe.
    ///
    /// The balance contribution of the endpoint is multiplied accordingly.
    /// Only meaningful on unmanaged endpoints: the runtime opens managed
    /// pipes exactly once.
    pub fn reopen(mut self, k: u32) -> Self {
        self.reopen = k;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_reader(&self) -> bool {
        self.direction == Direction::Reader
    }

    pub fn fan_count(&self) -> usize {
        self.fan
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn mode(&self) -> PipeMode {
        self.mode
    }

    pub fn reopen_count(&self) -> u32 {
        self.reopen
    }

    /// Substitutes the stage-render placeholders into the name template.
    ///
    /// `{workflow}` always resolves; `{n}` resolves from `index` when the
    /// stage is a replicated worker, and otherwise stays in place as the fan
    /// placeholder.
    pub(crate) fn resolve(&self, workflow: &str, index: Option<usize>) -> Result<Endpoint> {
        self.check()?;
        let mut name = self.name.replace("{workflow}", workflow);
        if let Some(i) = index {
            if self.fan == 1 {
                name = name.replace("{n}", &i.to_string());
            }
        }
        Ok(Endpoint {
            name,
            ..self.clone()
        })
    }

    /// Expands the (resolved) endpoint into its concrete pipe names, exactly
    /// `fan` of them.
    pub(crate) fn expand(&self) -> Result<Vec<String>> {
        if self.fan > 1 {
            if !self.name.contains("{n}") {
                return Err(Error::invalid_endpoint(format!(
                    "endpoint '{}' has fan {} but no {{n}} placeholder",
                    self.name, self.fan
                )));
            }
            Ok((0..self.fan)
                .map(|i| self.name.replace("{n}", &i.to_string()))
                .collect())
        } else {
            if self.name.contains("{n}") {
                return Err(Error::invalid_endpoint(format!(
                    "endpoint '{}' has an unresolved {{n}} placeholder",
                    self.name
                )));
            }
            Ok(vec![self.name.clone()])
        }
    }

    fn check(&self) -> Result<()> {
        if self.fan == 0 {
            return Err(Error::invalid_endpoint(format!(
                "endpoint '{}' has fan 0",
                self.name
            )));
        }
        if self.reopen == 0 {
            return Err(Error::invalid_endpoint(format!(
                "endpoint '{}' declares zero open/close cycles",
                self.name
            )));
        }
        if self.reopen > 1 && self.managed {
            return Err(Error::invalid_endpoint(format!(
                "endpoint '{}' declares reopen={} but is managed; reopen cycles require an unmanaged endpoint",
                self.name, self.reopen
            )));
        }
        Ok(())
    }
}
