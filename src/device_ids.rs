use std::fmt::Display;

pub const HIDOCK_VID: u16 = 0x10d6;

/// USB interface carrying the command protocol.
pub const INTERFACE_NUMBER: u8 = 0;
/// Bulk IN endpoint address (endpoint 2, device to host).
pub const ENDPOINT_IN: u8 = 0x82;
/// Bulk OUT endpoint address (endpoint 1, host to device).
pub const ENDPOINT_OUT: u8 = 0x01;

const KNOWN_MODELS: &[(u16, DeviceModel)] = &[
    (0xaf0c, DeviceModel::H1),
    (0xaf0d, DeviceModel::H1E),
    (0xaf0e, DeviceModel::P1),
    (0xb00d, DeviceModel::Generic),
];

/// A USB vendor ID and product ID pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl Display for UsbId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vid, self.pid)
    }
}

/// Hardware variants that speak the HiDock command protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceModel {
    H1,
    H1E,
    P1,
    /// Units enumerating with the default product ID.
    Generic,
}

impl DeviceModel {
    pub fn product_id(self) -> u16 {
        KNOWN_MODELS
            .iter()
            .find(|(_, model)| *model == self)
            .map(|(pid, _)| *pid)
            .unwrap_or(0xb00d)
    }
}

impl Display for DeviceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceModel::H1 => write!(f, "HiDock H1"),
            DeviceModel::H1E => write!(f, "HiDock H1E"),
            DeviceModel::P1 => write!(f, "HiDock P1"),
            DeviceModel::Generic => write!(f, "HiDock"),
        }
    }
}

/// Compatibility of a device, with detected model if applicable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceCompat {
    /// Known to speak the HiDock protocol.
    Compatible(DeviceModel),
    /// Has the HiDock vendor ID but a product ID we have never seen. Usable with "force" flag.
    Untested,
    /// Definitely not a HiDock. Treated as if it doesn't exist.
    Incompatible,
}

impl Display for DeviceCompat {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceCompat::Compatible(model) => write!(f, "compatible {model}"),
            DeviceCompat::Untested => write!(f, "UNTESTED device"),
            DeviceCompat::Incompatible => write!(f, "incompatible device"),
        }
    }
}

/// Find a device's compatibility and model based on its USB ID.
pub fn identify_device(id: UsbId) -> DeviceCompat {
    if id.vid != HIDOCK_VID {
        return DeviceCompat::Incompatible;
    }

    match KNOWN_MODELS.iter().find(|(pid, _)| *pid == id.pid) {
        Some((_, model)) => DeviceCompat::Compatible(*model),
        None => DeviceCompat::Untested,
    }
}

/// Everything needed to open the command interface of one physical unit. Immutable for the
/// lifetime of a session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface_number: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

impl DeviceIdentity {
    /// Identity of a HiDock with the given product ID, using the fixed interface and endpoints.
    pub fn for_product(product_id: u16) -> Self {
        Self {
            vendor_id: HIDOCK_VID,
            product_id,
            interface_number: INTERFACE_NUMBER,
            endpoint_in: ENDPOINT_IN,
            endpoint_out: ENDPOINT_OUT,
        }
    }

    pub fn usb_id(&self) -> UsbId {
        UsbId {
            vid: self.vendor_id,
            pid: self.product_id,
        }
    }
}

impl From<DeviceModel> for DeviceIdentity {
    fn from(model: DeviceModel) -> Self {
        Self::for_product(model.product_id())
    }
}
