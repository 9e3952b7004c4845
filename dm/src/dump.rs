//! Text renderings of the driver-model state for console commands.
use alloc::{string::String, vec::Vec};
use core::fmt::{self, Write};

use crate::{device::DeviceHandle, root::Dm};

fn seq_text(dev: &DeviceHandle) -> String {
    dev.seq().map_or(String::from("-"), |seq| alloc::format!("{}", seq))
}

impl Dm {
    /// Write the device graph, one device per line with tree branches in front of the name.
    pub fn write_tree(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, " Class     Seq    Probed  Driver                Name")?;
        writeln!(out, "{:-<72}", "")?;
        if let Some(root) = self.root() {
            write_device(out, &root, &mut Vec::new())?;
        }
        Ok(())
    }

    pub fn dump_tree(&self) -> String {
        let mut out = String::new();
        let _ = self.write_tree(&mut out);
        out
    }

    /// Write every uclass with its members in bind order.
    pub fn write_uclasses(&self, out: &mut impl Write) -> fmt::Result {
        for id in self.uclass_ids() {
            let Some(uc) = self.uclass_find(id) else {
                continue;
            };
            writeln!(out, "uclass {}: {}", id as u32, uc.name())?;
            for (idx, dev) in uc.devices().iter().enumerate() {
                let probed = if dev.is_probed() { '*' } else { ' ' };
                writeln!(out, "{:<3} {} {}, seq {}", idx, probed, dev.name(), seq_text(dev))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    pub fn dump_uclasses(&self) -> String {
        let mut out = String::new();
        let _ = self.write_uclasses(&mut out);
        out
    }

    /// Write every registered driver with its uclass and the devices using it.
    pub fn write_drivers(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "{:<24}  {:>3}  {:<16}  Devices", "Driver", "uid", "uclass")?;
        writeln!(out, "{:-<72}", "")?;
        for drv in self.drivers.iter() {
            let devices: Vec<DeviceHandle> = self
                .uclass_devices(drv.id)
                .into_iter()
                .filter(|dev| core::ptr::eq(dev.driver(), drv))
                .collect();
            write!(out, "{:<24.24}  {:>3}  {:<16.16}  ", drv.name, drv.id as u32, drv.id.name())?;
            if devices.is_empty() {
                writeln!(out, "<none>")?;
                continue;
            }
            let names: Vec<&str> = devices.iter().map(|dev| dev.name()).collect();
            writeln!(out, "{}", names.join(", "))?;
        }
        Ok(())
    }

    pub fn dump_drivers(&self) -> String {
        let mut out = String::new();
        let _ = self.write_drivers(&mut out);
        out
    }

    /// Write the compatible strings of every driver.
    pub fn write_compat(&self, out: &mut impl Write) -> fmt::Result {
        writeln!(out, "{:<24}  Compatible", "Driver")?;
        writeln!(out, "{:-<72}", "")?;
        for drv in self.drivers.iter() {
            let mut compats = drv.of_match.iter();
            match compats.next() {
                Some(first) => writeln!(out, "{:<24.24}  {}", drv.name, first.compatible)?,
                None => writeln!(out, "{:<24.24}", drv.name)?,
            }
            for id in compats {
                writeln!(out, "{:<24}  {}", "", id.compatible)?;
            }
        }
        Ok(())
    }

    pub fn dump_compat(&self) -> String {
        let mut out = String::new();
        let _ = self.write_compat(&mut out);
        out
    }
}

/// `last` holds, for each ancestor level, whether that ancestor is the last of its siblings.
fn write_device(out: &mut impl Write, dev: &DeviceHandle, last: &mut Vec<bool>) -> fmt::Result {
    let probed = if dev.is_probed() { '+' } else { ' ' };
    write!(
        out,
        " {:<10.10} {:>3}    [ {} ]   {:<20.20}  ",
        dev.uclass().name(),
        seq_text(dev),
        probed,
        dev.driver().name
    )?;
    if let Some((this, ancestors)) = last.split_last() {
        for ancestor_last in ancestors {
            out.write_str(if *ancestor_last { "    " } else { "|   " })?;
        }
        out.write_str(if *this { "`-- " } else { "|-- " })?;
    }
    writeln!(out, "{}", dev.name())?;

    let children = dev.children();
    for (idx, child) in children.iter().enumerate() {
        last.push(idx + 1 == children.len());
        write_device(out, child, last)?;
        last.pop();
    }
    Ok(())
}
