//! Miniserver context
//!
//! [`MiniserverContext`] pairs a structure description with a connection:
//! it materializes the controls, rebuilds the state-identifier routing table
//! whenever the structure (or the connection) is replaced, and keeps the
//! controls updated from the connection's state stream in a background task.
//!
//! Whether the context owns its connection is decided explicitly at
//! composition time; an owned connection is torn down with the context, a
//! borrowed one is left untouched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::message::{TextState, ValueState};
use crate::client::MiniserverConnection;
use crate::events::SubscriberTable;
use crate::structure::controls::Control;
use crate::structure::StructureFile;
use crate::uuid::Uuid;

type ControlMap = Arc<RwLock<HashMap<Uuid, Control>>>;
type ChangeSinks = Arc<StdMutex<Vec<mpsc::UnboundedSender<Uuid>>>>;

/// Context object binding a structure description to a connection.
pub struct MiniserverContext {
    structure: StructureFile,
    connection: Option<Arc<MiniserverConnection>>,
    owns_connection: bool,
    controls: ControlMap,
    change_sinks: ChangeSinks,
    update_task: Option<JoinHandle<()>>,
}

impl MiniserverContext {
    /// Context without a connection; controls are materialized but receive
    /// no updates until a connection is attached.
    pub fn new(structure: StructureFile) -> Self {
        let mut context = Self {
            structure,
            connection: None,
            owns_connection: false,
            controls: Arc::new(RwLock::new(HashMap::new())),
            change_sinks: Arc::new(StdMutex::new(Vec::new())),
            update_task: None,
        };
        context.rebuild();
        context
    }

    /// Context wired to `connection`. `owns_connection` decides which side
    /// is responsible for the final teardown.
    ///
    /// Must be called within a tokio runtime; the update task starts here.
    pub fn with_connection(
        structure: StructureFile,
        connection: Arc<MiniserverConnection>,
        owns_connection: bool,
    ) -> Self {
        let mut context = Self {
            structure,
            connection: Some(connection),
            owns_connection,
            controls: Arc::new(RwLock::new(HashMap::new())),
            change_sinks: Arc::new(StdMutex::new(Vec::new())),
            update_task: None,
        };
        context.rebuild();
        context
    }

    pub fn structure_file(&self) -> &StructureFile {
        &self.structure
    }

    pub fn connection(&self) -> Option<&Arc<MiniserverConnection>> {
        self.connection.as_ref()
    }

    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// The materialized controls, keyed by control identifier.
    pub fn controls(&self) -> &ControlMap {
        &self.controls
    }

    /// Channel receiving the identifier of every control whose state
    /// changed.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<Uuid> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.change_sinks
            .lock()
            .expect("change sinks poisoned")
            .push(tx);
        rx
    }

    /// Replace the structure description and rebuild controls and routing
    /// wholesale.
    pub fn set_structure_file(&mut self, structure: StructureFile) {
        self.structure = structure;
        self.rebuild();
    }

    /// Replace the connection. The previous connection is closed first when
    /// this context owns it.
    pub async fn set_connection(
        &mut self,
        connection: Arc<MiniserverConnection>,
        owns_connection: bool,
    ) {
        self.detach_connection().await;
        self.connection = Some(connection);
        self.owns_connection = owns_connection;
        self.rebuild();
    }

    /// Stop state routing and, if owned, tear the connection down.
    pub async fn close(&mut self) {
        if let Some(task) = self.update_task.take() {
            task.abort();
        }
        self.detach_connection().await;
    }

    async fn detach_connection(&mut self) {
        if let Some(task) = self.update_task.take() {
            task.abort();
        }
        if let Some(connection) = self.connection.take() {
            if self.owns_connection {
                connection.close().await;
            }
        }
        self.owns_connection = false;
    }

    /// Rebuild the control set and the state routing table from the current
    /// structure description, and swap the connection's subscriber table to
    /// a fresh snapshot.
    fn rebuild(&mut self) {
        if let Some(task) = self.update_task.take() {
            task.abort();
        }

        let mut controls = HashMap::new();
        let mut state_to_control = HashMap::new();
        for (uuid, record) in self.structure.controls() {
            let control = Control::from_structure(*uuid, record.clone(), &self.structure);
            for state in control.state_uuids() {
                state_to_control.insert(state, *uuid);
            }
            controls.insert(*uuid, control);
        }
        debug!(
            controls = controls.len(),
            states = state_to_control.len(),
            "controls rebuilt"
        );

        let controls = Arc::new(RwLock::new(controls));
        self.controls = Arc::clone(&controls);

        let Some(connection) = &self.connection else {
            return;
        };

        let mut builder = SubscriberTable::builder();
        let value_rx = builder.subscribe_values(state_to_control.keys().copied());
        let text_rx = builder.subscribe_texts(state_to_control.keys().copied());
        connection.router().install(builder.build());

        let sinks = Arc::clone(&self.change_sinks);
        self.update_task = Some(tokio::spawn(run_updates(
            controls,
            state_to_control,
            value_rx,
            text_rx,
            sinks,
        )));
    }
}

impl Drop for MiniserverContext {
    fn drop(&mut self) {
        if let Some(task) = self.update_task.take() {
            task.abort();
        }
        if self.owns_connection {
            if let Some(connection) = self.connection.take() {
                connection.close_nowait();
            }
        }
    }
}

/// Applies incoming states to controls; ends when the subscriber table this
/// task was registered with is replaced (the channels close).
async fn run_updates(
    controls: ControlMap,
    state_to_control: HashMap<Uuid, Uuid>,
    mut value_rx: mpsc::UnboundedReceiver<ValueState>,
    mut text_rx: mpsc::UnboundedReceiver<TextState>,
    sinks: ChangeSinks,
) {
    loop {
        tokio::select! {
            value = value_rx.recv() => match value {
                Some(state) => {
                    apply_value(&controls, &state_to_control, &state, &sinks).await;
                }
                None => break,
            },
            text = text_rx.recv() => match text {
                Some(state) => {
                    apply_text(&controls, &state_to_control, &state, &sinks).await;
                }
                None => break,
            },
        }
    }
}

async fn apply_value(
    controls: &ControlMap,
    state_to_control: &HashMap<Uuid, Uuid>,
    state: &ValueState,
    sinks: &ChangeSinks,
) {
    let Some(control_uuid) = state_to_control.get(&state.control) else {
        return;
    };
    let mut guard = controls.write().await;
    if let Some(control) = guard.get_mut(control_uuid) {
        if control.apply_value_state(state) {
            notify(sinks, *control_uuid);
        }
    }
}

async fn apply_text(
    controls: &ControlMap,
    state_to_control: &HashMap<Uuid, Uuid>,
    state: &TextState,
    sinks: &ChangeSinks,
) {
    let Some(control_uuid) = state_to_control.get(&state.control) else {
        return;
    };
    let mut guard = controls.write().await;
    if let Some(control) = guard.get_mut(control_uuid) {
        if control.apply_text_state(state) {
            notify(sinks, *control_uuid);
        }
    }
}

fn notify(sinks: &ChangeSinks, control: Uuid) {
    sinks
        .lock()
        .expect("change sinks poisoned")
        .retain(|sink| sink.send(control).is_ok());
}
