use tracing::Instrument;

use super::{Stage, StageContext, StageDescription, StageError, StageKind};

/// A wrapper around a [`Stage`] which tracks the [`StageState`] and handles some tracing output
#[derive(Debug)]
pub struct StatefulStage<S> {
    pub(crate) stage: S,
    pub(crate) state: StageState,
}

impl<S> From<S> for StatefulStage<S>
where
    S: Stage,
{
    fn from(stage: S) -> Self {
        Self {
            stage,
            state: StageState::Uncompleted,
        }
    }
}

impl<S> StatefulStage<S>
where
    S: Stage + 'static,
{
    pub fn boxed(self) -> StatefulStage<Box<dyn Stage>> {
        StatefulStage {
            stage: Box::new(self.stage),
            state: self.state,
        }
    }

    pub fn inner(&self) -> &S {
        &self.stage
    }
}

impl StatefulStage<Box<dyn Stage>> {
    pub fn kind(&self) -> StageKind {
        self.stage.kind()
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn tracing_synopsis(&self) -> String {
        self.stage.tracing_synopsis()
    }

    /// Forget that the stage ran, so a rerun of the plan executes it again
    pub(crate) fn reset(&mut self) {
        tracing::debug!("Reset: {}", self.stage.tracing_synopsis());
        self.state = StageState::Uncompleted;
    }

    /// A description of what this stage would do during execution
    pub fn describe_execute(&self) -> Vec<StageDescription> {
        match self.state {
            StageState::Completed => vec![],
            _ => self.stage.execute_description(),
        }
    }

    /// Perform the stage, unless it already completed
    ///
    /// You should prefer this ([`try_execute`][StatefulStage::try_execute]) over [`execute`][Stage::execute] as it handles [`StageState`] and does tracing
    pub async fn try_execute(&mut self, ctx: &mut StageContext<'_>) -> Result<(), StageError> {
        match self.state {
            StageState::Completed => {
                tracing::trace!(
                    "Completed: (Already done) {}",
                    self.stage.tracing_synopsis()
                );
                Ok(())
            },
            _ => {
                self.state = StageState::Progress;
                tracing::debug!("Executing: {}", self.stage.tracing_synopsis());
                let span = self.stage.tracing_span();
                self.stage.execute(ctx).instrument(span).await?;
                self.state = StageState::Completed;
                tracing::debug!("Completed: {}", self.stage.tracing_synopsis());
                Ok(())
            },
        }
    }
}

/** The state of a [`Stage`]
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StageState {
    /// The stage finished, it is skipped if the plan is run again
    Completed,
    /// The stage started but did not finish, it either failed or was cancelled
    Progress,
    /// The stage has not started
    Uncompleted,
}
