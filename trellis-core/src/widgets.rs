//! Built-in component types.
//!
//! | Component   | State            | Server → client        | Client → server                  |
//! |-------------|------------------|------------------------|----------------------------------|
//! | `Label`     | `LabelState`     |                        |                                  |
//! | `CheckBox`  | `CheckBoxState`  |                        | `CheckBoxServerRpc`, focus/blur  |
//! | `TextField` | `TextFieldState` |                        | `TextFieldServerRpc`, focus/blur |
//! | `TreeGrid`  | `TreeGridState`  | `TreeGridClientRpc`    |                                  |

use crate::component::{Component, FieldState};
use crate::connector::{Connector, ConnectorRegistry};
use crate::event::{BlurEvent, FocusEvent, TreeGridExpansionEvent};
use crate::state::SharedState;

crate::shared_state! {
    pub struct LabelState {
        pub caption: Option<String> = None,
        pub description: Option<String> = None,
        pub visible: bool = true,
        pub enabled: bool = true,
        pub style_names: Vec<String> = Vec::new(),
        pub text: String = String::new(),
    }
}

crate::shared_state! {
    pub struct CheckBoxState {
        pub caption: Option<String> = None,
        pub description: Option<String> = None,
        pub visible: bool = true,
        pub enabled: bool = true,
        pub read_only: bool = false,
        pub checked: bool = false,
    }
}

crate::shared_state! {
    pub struct TextFieldState {
        pub caption: Option<String> = None,
        pub visible: bool = true,
        pub enabled: bool = true,
        pub read_only: bool = false,
        pub placeholder: Option<String> = None,
        pub max_length: Option<u32> = None,
        pub text: String = String::new(),
    }
}

crate::shared_state! {
    pub struct TreeGridState {
        pub caption: Option<String> = None,
        pub visible: bool = true,
        pub enabled: bool = true,
        /// Column captions, in display order
        pub columns: Vec<String> = Vec::new(),
        pub hierarchy_column: Option<String> = None,
    }
}

impl FieldState for CheckBoxState {
    type Value = bool;
    const VALUE_FIELD: &'static str = "checked";

    fn value(&self) -> &bool {
        &self.checked
    }

    fn set_value(&mut self, value: bool) {
        self.checked = value;
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

impl FieldState for TextFieldState {
    type Value = String;
    const VALUE_FIELD: &'static str = "text";

    fn value(&self) -> &String {
        &self.text
    }

    fn set_value(&mut self, value: String) {
        self.text = value;
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

crate::rpc_interface! {
    /// Expansion of hierarchical rows, driven by the server.
    pub enum TreeGridClientRpc: ClientRpc {
        SetExpanded { key: String },
        SetCollapsed { key: String },
    }
}

crate::rpc_interface! {
    pub enum CheckBoxServerRpc: ServerRpc {
        Clicked { checked: bool },
    }
}

crate::rpc_interface! {
    pub enum TextFieldServerRpc: ServerRpc {
        SetText { text: String },
    }
}

crate::rpc_interface! {
    pub enum FocusServerRpc: ServerRpc {
        Focus {},
        Blur {},
    }
}

pub type Label = Component<LabelState>;
pub type CheckBox = Component<CheckBoxState>;
pub type TextField = Component<TextFieldState>;
pub type TreeGrid = Component<TreeGridState>;

fn register_focus<S: SharedState>(component: &mut Component<S>) {
    component.register_rpc::<FocusServerRpc, _>(|c, rpc| {
        let source = c.key().cloned();
        match rpc {
            FocusServerRpc::Focus {} => c.fire_event(&FocusEvent { source })?,
            FocusServerRpc::Blur {} => c.fire_event(&BlurEvent { source })?,
        };
        Ok(())
    });
}

impl Component<LabelState> {
    pub fn label(text: impl Into<String>) -> Self {
        Self::with_state(LabelState {
            text: text.into(),
            ..LabelState::default()
        })
    }

    pub fn text(&self) -> &str {
        &self.state().text
    }

    /// No-op (and no dirty mark) when the text is unchanged.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if self.state().text != text {
            self.state_mut().text = text;
        }
    }
}

impl Component<CheckBoxState> {
    pub fn check_box(caption: impl Into<String>) -> Self {
        let mut check_box = Self::with_state(CheckBoxState {
            caption: Some(caption.into()),
            ..CheckBoxState::default()
        });
        check_box.register_rpc::<CheckBoxServerRpc, _>(|c, rpc| {
            let CheckBoxServerRpc::Clicked { checked } = rpc;
            c.set_value_from_client(checked)?;
            Ok(())
        });
        register_focus(&mut check_box);
        check_box
    }
}

impl Component<TextFieldState> {
    pub fn text_field(caption: impl Into<String>) -> Self {
        let mut field = Self::with_state(TextFieldState {
            caption: Some(caption.into()),
            ..TextFieldState::default()
        });
        field.register_rpc::<TextFieldServerRpc, _>(|c, rpc| {
            let TextFieldServerRpc::SetText { text } = rpc;
            c.set_value_from_client(text)?;
            Ok(())
        });
        register_focus(&mut field);
        field
    }
}

impl Component<TreeGridState> {
    pub fn tree_grid(columns: Vec<String>) -> Self {
        let hierarchy_column = columns.first().cloned();
        Self::with_state(TreeGridState {
            columns,
            hierarchy_column,
            ..TreeGridState::default()
        })
    }

    /// Tell the client to show `item_key`'s children.
    pub fn expand(&self, item_key: impl Into<String>) -> bool {
        self.call_client(TreeGridClientRpc::SetExpanded { key: item_key.into() })
    }

    pub fn collapse(&self, item_key: impl Into<String>) -> bool {
        self.call_client(TreeGridClientRpc::SetCollapsed { key: item_key.into() })
    }
}

impl Connector<CheckBoxState> {
    /// User toggled the box: update the mirror and notify the server.
    pub fn click(&mut self, checked: bool) -> bool {
        if self.state().read_only {
            return false;
        }
        self.update_local(|state| state.checked = checked);
        self.call_server(CheckBoxServerRpc::Clicked { checked })
    }
}

impl Connector<TextFieldState> {
    pub fn type_text(&mut self, text: impl Into<String>) -> bool {
        if self.state().read_only {
            return false;
        }
        let text = text.into();
        self.update_local(|state| state.text = text.clone());
        self.call_server(TextFieldServerRpc::SetText { text })
    }
}

/// Tree grid connector firing a [`TreeGridExpansionEvent`] per expansion RPC.
pub fn tree_grid_connector() -> Connector<TreeGridState> {
    let mut connector = Connector::new();
    connector.register_rpc::<TreeGridClientRpc, _>(|c, rpc| {
        let (item_key, expanded) = match rpc {
            TreeGridClientRpc::SetExpanded { key } => (key, true),
            TreeGridClientRpc::SetCollapsed { key } => (key, false),
        };
        c.fire_event(&TreeGridExpansionEvent {
            source: c.key().cloned(),
            item_key,
            expanded,
        })?;
        Ok(())
    });
    connector
}

pub(crate) fn register_builtin_connectors(registry: &mut ConnectorRegistry) {
    registry.register_default::<LabelState>();
    registry.register_default::<CheckBoxState>();
    registry.register_default::<TextFieldState>();
    registry.register::<TreeGridState, _>(tree_grid_connector);
}
