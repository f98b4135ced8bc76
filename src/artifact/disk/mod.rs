//! Disk level helpers: partition discovery and VHD conversion.

pub mod partitions;
pub mod vhd;

pub use partitions::{
    get_all_partitions, get_device_by_label, get_device_partitions, get_full_device_by_label,
    get_partition_fs, Partition,
};
pub use vhd::{chs_calculation, raw_disk_to_fixed_vhd, Geometry, VhdFooter};
