use {
    super::{DriverError, PhysicalDevice},
    ash::{extensions::ext::DebugUtils, vk, Entry},
    log::{debug, error, info, trace, warn},
    std::{
        borrow::Cow,
        ffi::{CStr, CString},
        fmt::{Debug, Formatter},
        ops::Deref,
        os::raw::{c_char, c_void},
        thread::panicking,
    },
};

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if panicking() || callback_data.is_null() {
        return vk::FALSE;
    }

    let callback_data = &*callback_data;
    let message = if callback_data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("🆘 {ty:?} {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("{ty:?} {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("{ty:?} {message}");
    } else {
        trace!("{ty:?} {message}");
    }

    vk::FALSE
}

/// There is no global state in Vulkan and all per-application state is stored in a VkInstance
/// object.
///
/// Creating an Instance initializes the Vulkan library. When `debug` is requested the Khronos
/// validation layer is enabled and its messages are forwarded to the `log` facade.
pub struct Instance {
    debug_messenger: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub(crate) entry: Entry,
    instance: ash::Instance,
}

impl Instance {
    /// Creates a new Vulkan 1.2 instance which enables the given window-system extensions.
    #[profiling::function]
    pub fn create<'a>(
        debug: bool,
        required_extensions: impl Iterator<Item = &'a CStr>,
    ) -> Result<Self, DriverError> {
        let entry = unsafe {
            Entry::load().map_err(|err| {
                error!("Vulkan driver not found: {err}");

                DriverError::DeviceUnavailable
            })?
        };

        let required_extensions = required_extensions.collect::<Vec<_>>();
        let instance_extensions = required_extensions
            .iter()
            .map(|ext| ext.as_ptr())
            .chain(Self::extension_names(debug))
            .collect::<Box<[_]>>();
        let layer_names = Self::layer_names(debug);
        let layer_names = layer_names
            .iter()
            .map(|raw_name| raw_name.as_ptr())
            .collect::<Box<[*const c_char]>>();
        let app_name = CString::new("infinity-mirror").unwrap_or_default();
        let app_desc = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .api_version(vk::API_VERSION_1_2);
        let instance_desc = vk::InstanceCreateInfo::builder()
            .application_info(&app_desc)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&instance_extensions);

        let instance = unsafe {
            entry.create_instance(&instance_desc, None).map_err(|err| {
                if debug {
                    warn!("debug may only be enabled with a valid Vulkan SDK installation");
                }

                error!("Vulkan driver does not support API v1.2: {err}");

                for extension_name in &required_extensions {
                    debug!("Extension: {:?}", extension_name);
                }

                DriverError::DeviceUnavailable
            })?
        };

        trace!("created a Vulkan instance");

        let debug_messenger = if debug {
            let debug_utils = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            match unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(err) => {
                    warn!("unable to create debug messenger: {err}");

                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            debug_messenger,
            entry,
            instance,
        })
    }

    fn extension_names(debug: bool) -> impl Iterator<Item = *const c_char> {
        debug.then(|| DebugUtils::name().as_ptr()).into_iter()
    }

    /// Returns `true` if this instance was created with debug layers enabled.
    pub fn is_debug(this: &Self) -> bool {
        this.debug_messenger.is_some()
    }

    fn layer_names(debug: bool) -> Vec<CString> {
        let mut res = vec![];

        if debug {
            if let Ok(layer) = CString::new("VK_LAYER_KHRONOS_validation") {
                res.push(layer);
            }
        }

        res
    }

    /// Returns the physical devices of this instance which support Vulkan 1.2.
    #[profiling::function]
    pub fn physical_devices(this: &Self) -> Result<Vec<PhysicalDevice>, DriverError> {
        let physical_devices = unsafe { this.enumerate_physical_devices() }.map_err(|err| {
            error!("unable to enumerate physical devices: {err}");

            DriverError::DeviceUnavailable
        })?;

        Ok(physical_devices
            .into_iter()
            .map(|physical_device| PhysicalDevice::new(this, physical_device))
            .filter(|physical_device| {
                let api_version = physical_device.props.api_version;
                let major = vk::api_version_major(api_version);
                let minor = vk::api_version_minor(api_version);
                let supports_vulkan_1_2 = major > 1 || (major == 1 && minor >= 2);

                if !supports_vulkan_1_2 {
                    info!("physical device {physical_device:?} does not support Vulkan v1.2");
                }

                supports_vulkan_1_2
            })
            .collect())
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Instance")
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for Instance {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            if let Some((debug_utils, messenger)) = self.debug_messenger.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}
