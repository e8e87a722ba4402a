//! Builtin command dispatch.
//!
//! Rules can tag a `RUN` entry with a builtin name (`RUN{builtin}="hwdb"`)
//! instead of an external program path. Builtins run in-process and set
//! properties directly on the device, mirroring `udev_builtin_run`
//! dispatching on `enum udev_builtin_cmd` by integer tag; here the tag is
//! the builtin's registered name instead of an enum discriminant, since
//! nothing else in this crate needs the numeric form.

use crate::device::Device;
use crate::hwdb::{parse_modalias, DeviceMatch, Hwdb};
use tracing::{debug, warn};

pub struct BuiltinRegistry {
    hwdb: Hwdb,
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self { hwdb: Hwdb::new() }
    }

    pub fn with_hwdb(hwdb: Hwdb) -> Self {
        Self { hwdb }
    }

    /// Run the builtin named `tag` against `dev`. `command` is the
    /// already-format-expanded argument line from the rule (most
    /// builtins ignore it; `hwdb` does not take one at all). `test`
    /// suppresses property application for dry runs.
    pub fn run(&self, tag: &str, dev: &mut Device, command: &str, test: bool) -> i32 {
        match tag {
            "hwdb" => self.run_hwdb(dev, test),
            "path_id" => self.run_path_id(dev, test),
            "kmod" => self.run_kmod(dev, command),
            other => {
                warn!("unknown builtin command '{}', ignoring", other);
                -1
            }
        }
    }

    fn run_hwdb(&self, dev: &mut Device, test: bool) -> i32 {
        let Some(modalias) = dev.property("MODALIAS").map(str::to_string) else {
            return 0;
        };

        let props = self.hwdb.get_properties(&modalias);
        if !test {
            for (k, v) in props {
                dev.properties.insert(k, v);
            }
        }

        if let Some(m) = parse_modalias(&modalias) {
            self.apply_vendor_name(dev, m, test);
        }

        0
    }

    fn apply_vendor_name(&self, dev: &mut Device, m: DeviceMatch, test: bool) {
        let name = match m {
            DeviceMatch::Usb { vendor, product, .. } => self.hwdb.lookup_usb(vendor, product),
            DeviceMatch::Pci { vendor, device, .. } => self.hwdb.lookup_pci(vendor, device),
            DeviceMatch::Input { .. } => None,
        };

        if let Some(name) = name {
            debug!("hwdb matched vendor '{}' for {}", name, dev.syspath);
            if !test {
                dev.properties.insert("ID_VENDOR_FROM_DATABASE", name.to_string());
            }
        }
    }

    /// Composes a stable `by-path` identifier from the device's sysfs
    /// path, the closest real analogue this crate has to upstream's
    /// `path_id` builtin without walking PCI/USB topology in full.
    fn run_path_id(&self, dev: &mut Device, test: bool) -> i32 {
        let segments: Vec<&str> = dev
            .devpath
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        if segments.is_empty() {
            return 0;
        }

        let id = format!("pci-{}", segments.join("-"));
        if !test {
            dev.properties.insert("ID_PATH", id);
        }
        0
    }

    fn run_kmod(&self, dev: &mut Device, command: &str) -> i32 {
        debug!("kmod builtin invoked for {} with '{}' (module loading is out of scope)", dev.syspath, command);
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Action;

    #[test]
    fn hwdb_builtin_sets_vendor_from_usb_modalias() {
        let registry = BuiltinRegistry::new();
        let mut dev = Device::bare("usb1", Action::Add);
        dev.properties.insert("MODALIAS", "usb:v05ACp1234d0100dc00dsc00dp00ic00isc00ip00in00");

        registry.run("hwdb", &mut dev, "", false);

        assert_eq!(dev.property("ID_VENDOR_FROM_DATABASE"), Some("Apple, Inc."));
    }

    #[test]
    fn test_mode_does_not_mutate_device() {
        let registry = BuiltinRegistry::new();
        let mut dev = Device::bare("usb1", Action::Add);
        dev.properties.insert("MODALIAS", "usb:v05ACp1234d0100dc00dsc00dp00ic00isc00ip00in00");

        registry.run("hwdb", &mut dev, "", true);

        assert_eq!(dev.property("ID_VENDOR_FROM_DATABASE"), None);
    }

    #[test]
    fn unknown_builtin_is_ignored() {
        let registry = BuiltinRegistry::new();
        let mut dev = Device::bare("sda", Action::Add);
        assert_eq!(registry.run("nonexistent", &mut dev, "", false), -1);
    }
}
