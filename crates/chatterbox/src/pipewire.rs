//! PipeWire implementation of [`AudioBackend`].
//!
//! Enumeration runs a short-lived main loop that collects audio nodes from
//! the registry; streams run on their own threads (see
//! [`crate::pipewire_output`] and [`crate::pipewire_input`]).

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;
use std::time::Duration;

use pipewire::{
    context::ContextRc, main_loop::MainLoopRc, registry::GlobalObject, types::ObjectType,
};
use tracing::debug;

use crate::backend::{AudioBackend, AudioSink, AudioSource, StreamFormat};
use crate::error::ChatterError;
use crate::pipewire_input::{PipeWireInputConfig, PipeWireSource};
use crate::pipewire_output::{PipeWireOutputConfig, PipeWireSink};
use crate::registry::{DeviceDescriptor, DEFAULT_DEVICE};

static PIPEWIRE_INIT: Once = Once::new();

/// Initialize the PipeWire library exactly once per process.
pub(crate) fn init_once() {
    PIPEWIRE_INIT.call_once(|| {
        pipewire::init();
    });
}

/// Serialize an F32LE `EnumFormat` pod for `channels` at `sample_rate`.
pub(crate) fn format_pod(sample_rate: u32, channels: u32) -> Result<Vec<u8>, String> {
    use pipewire::spa;

    let mut audio_info = spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(sample_rate);
    audio_info.set_channels(channels);

    let mut position = [0u32; spa::param::audio::MAX_CHANNELS];
    if channels == 1 {
        position[0] = spa::sys::SPA_AUDIO_CHANNEL_MONO;
    } else {
        position[0] = spa::sys::SPA_AUDIO_CHANNEL_FL;
        position[1] = spa::sys::SPA_AUDIO_CHANNEL_FR;
    }
    audio_info.set_position(position);

    let values = spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &spa::pod::Value::Object(spa::pod::Object {
            type_: spa::sys::SPA_TYPE_OBJECT_Format,
            id: spa::sys::SPA_PARAM_EnumFormat,
            properties: audio_info.into(),
        }),
    )
    .map_err(|e| format!("Failed to serialize format: {}", e))?
    .0
    .into_inner();
    Ok(values)
}

/// Audio backend talking to the local PipeWire daemon.
#[derive(Debug, Default)]
pub struct PipeWireBackend {
    stream_name: String,
}

impl PipeWireBackend {
    pub fn new() -> Self {
        init_once();
        Self {
            stream_name: "chatterbox".to_string(),
        }
    }

    fn target(device: &str) -> Option<String> {
        (device != DEFAULT_DEVICE).then(|| device.to_string())
    }

    fn require(&self, device: &str, output: bool) -> Result<(), ChatterError> {
        if device == DEFAULT_DEVICE {
            return Ok(());
        }
        let found = self
            .devices()?
            .into_iter()
            .any(|d| d.id == device && if output { d.output } else { d.input });
        if found {
            Ok(())
        } else {
            Err(ChatterError::DeviceUnavailable(format!(
                "no {} device '{}'",
                if output { "output" } else { "input" },
                device
            )))
        }
    }
}

impl AudioBackend for PipeWireBackend {
    fn devices(&self) -> Result<Vec<DeviceDescriptor>, ChatterError> {
        enumerate().map_err(|e| ChatterError::DeviceUnavailable(e.to_string()))
    }

    fn open_output(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSink>, ChatterError> {
        self.require(device, true)?;
        let config = PipeWireOutputConfig::from_format(&self.stream_name, Self::target(device), format);
        Ok(Box::new(PipeWireSink::open(config)?))
    }

    fn open_input(
        &self,
        device: &str,
        format: StreamFormat,
    ) -> Result<Box<dyn AudioSource>, ChatterError> {
        self.require(device, false)?;
        let config = PipeWireInputConfig::from_format(
            &format!("{}-capture", self.stream_name),
            Self::target(device),
            format,
        );
        Ok(Box::new(PipeWireSource::open(config)?))
    }
}

/// Collect audio nodes from the registry.
fn enumerate() -> anyhow::Result<Vec<DeviceDescriptor>> {
    use anyhow::Context as _;

    init_once();
    let devices = Rc::new(RefCell::new(Vec::new()));

    let mainloop = MainLoopRc::new(None).context("Failed to create PipeWire main loop")?;
    let context = ContextRc::new(&mainloop, None).context("Failed to create PipeWire context")?;
    let core = context.connect_rc(None).context("Failed to connect to PipeWire")?;
    let registry = core
        .get_registry_rc()
        .context("Failed to get PipeWire registry")?;

    let devices_clone = devices.clone();
    let _listener = registry
        .add_listener_local()
        .global(move |global| {
            if let Some(device) = describe(global) {
                devices_clone.borrow_mut().push(device);
            }
        })
        .register();

    let mainloop_weak = mainloop.downgrade();
    let timer = mainloop.loop_().add_timer(move |_| {
        if let Some(mainloop) = mainloop_weak.upgrade() {
            mainloop.quit();
        }
    });
    timer
        .update_timer(Some(Duration::from_millis(100)), None)
        .into_result()
        .context("Failed to set timer")?;

    mainloop.run();

    let result = devices.borrow().clone();
    debug!(count = result.len(), "enumerated audio devices");
    Ok(result)
}

fn describe<P: AsRef<pipewire::spa::utils::dict::DictRef>>(
    global: &GlobalObject<P>,
) -> Option<DeviceDescriptor> {
    if global.type_ != ObjectType::Node {
        return None;
    }
    let props = global.props.as_ref()?.as_ref();
    let (input, output) = match props.get(*pipewire::keys::MEDIA_CLASS)? {
        "Audio/Sink" => (false, true),
        "Audio/Source" => (true, false),
        "Audio/Duplex" => (true, true),
        _ => return None,
    };
    let id = props
        .get(*pipewire::keys::NODE_NAME)
        .map(String::from)
        .unwrap_or_else(|| format!("node-{}", global.id));
    let name = props
        .get(*pipewire::keys::NODE_DESCRIPTION)
        .map(String::from)
        .unwrap_or_else(|| id.clone());
    Some(DeviceDescriptor {
        id,
        name,
        input,
        output,
    })
}
