//! Trellis demo: a small sign-up form driven entirely by the server.
//!
//! ```text
//! trellis-demo                 # serve on TRELLIS_BIND_ADDR (127.0.0.1:9191)
//! trellis-demo client [url]    # headless client: type a name, tick the box
//! ```

use log::{info, warn};
use tokio::time::{timeout, Duration};
use trellis_core::widgets::{
    CheckBox, CheckBoxState, Label, LabelState, TextField, TextFieldState, TreeGrid,
};
use trellis_core::{
    BoxError, ComponentKey, Connector, ConnectorRegistry, Listener, ValueChangeEvent,
};
use trellis_sync::{ClientConfig, ServerConfig, ServerSession, SyncClient, SyncEvent, SyncServer};

fn greeting_key() -> ComponentKey {
    ComponentKey::from("greeting")
}

fn name_key() -> ComponentKey {
    ComponentKey::from("name")
}

fn subscribe_key() -> ComponentKey {
    ComponentKey::from("subscribe")
}

fn greeting_text(name: &str, subscribed: bool) -> String {
    let name = if name.is_empty() { "stranger" } else { name };
    if subscribed {
        format!("Welcome aboard, {name}!")
    } else {
        format!("Hello, {name}.")
    }
}

/// Recompute the greeting from the current form values.
fn refresh_greeting(session: &mut ServerSession) -> Result<(), BoxError> {
    let name = session
        .component::<TextField>(&name_key())
        .ok_or("name field missing")?
        .value()
        .clone();
    let subscribed = *session
        .component::<CheckBox>(&subscribe_key())
        .ok_or("subscribe box missing")?
        .value();
    session
        .component_mut::<Label>(&greeting_key())
        .ok_or("greeting label missing")?
        .set_text(greeting_text(&name, subscribed));
    Ok(())
}

fn build_form(session: &mut ServerSession) -> Result<(), BoxError> {
    let tasks = session.tasks();

    let mut greeting_label = Label::label(greeting_text("", false));
    greeting_label.state_mut().style_names.push("headline".into());
    session.bind(greeting_key(), greeting_label)?;

    let mut name_field = TextField::text_field("Name");
    name_field.state_mut().placeholder = Some("Your name".into());
    name_field.state_mut().max_length = Some(64);
    let on_name = tasks.clone();
    name_field.add_value_change_listener(Listener::new(move |_: &ValueChangeEvent<String>| {
        on_name.defer(refresh_greeting);
        Ok(())
    }))?;
    session.bind(name_key(), name_field)?;

    let subscribe_box = CheckBox::check_box("Subscribe to the newsletter");
    subscribe_box.add_value_change_listener(Listener::new(move |e: &ValueChangeEvent<bool>| {
        info!("Subscription {}", if e.new_value { "on" } else { "off" });
        tasks.defer(refresh_greeting);
        Ok(())
    }))?;
    session.bind(subscribe_key(), subscribe_box)?;

    let topics = session.attach(TreeGrid::tree_grid(vec!["Topic".into(), "Posts".into()]))?;
    if let Some(grid) = session.component::<TreeGrid>(&topics) {
        grid.expand("releases");
    }
    Ok(())
}

async fn run_server() -> Result<(), BoxError> {
    let config = ServerConfig::from_env();
    info!("Starting demo server on ws://{}", config.bind_addr);
    SyncServer::new(config, build_form).run().await
}

async fn run_client(url: String) -> Result<(), BoxError> {
    let mut client = SyncClient::new(ClientConfig::new(url), ConnectorRegistry::with_builtins());
    let mut events = client.take_event_rx().ok_or("event receiver already taken")?;
    client.connect().await?;

    let mut acted = false;
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), events.recv()).await {
        match event {
            SyncEvent::Connected { session_id, resumed } => {
                info!("Connected to session {session_id} (resumed: {resumed})");
            }
            SyncEvent::CycleApplied(report) => {
                let text = client
                    .with_session(|s| {
                        s.connector::<Connector<LabelState>>(&greeting_key())
                            .map(|c| c.state().text.clone())
                    })
                    .await;
                info!("Cycle {} applied, greeting: {text:?}", report.seq);

                if !acted {
                    acted = true;
                    client
                        .with_session(|s| {
                            if let Some(field) = s.connector_mut::<Connector<TextFieldState>>(&name_key()) {
                                field.type_text("Ada");
                            }
                            if let Some(check) = s.connector_mut::<Connector<CheckBoxState>>(&subscribe_key()) {
                                check.click(true);
                            }
                        })
                        .await;
                    let seq = client.flush().await?;
                    info!("Sent client cycle {seq}");
                } else {
                    break;
                }
            }
            SyncEvent::ProtocolFault(reason) => warn!("Protocol fault: {reason}"),
            SyncEvent::Disconnected => break,
        }
    }

    client.disconnect();
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        Some("client") => {
            let url = args.next().unwrap_or_else(|| "ws://127.0.0.1:9191".to_string());
            run_client(url).await
        }
        _ => run_server().await,
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
