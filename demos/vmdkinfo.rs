//! Prints basic information about a VMDK image: media size, disk type,
//! content identifiers, parent linkage and the extent list. Mirrors the
//! shape of the original `vmdkinfo` CLI from libvmdk's tools directory.

use clap::{Arg, Command};
use vmdk_image::{DiskType, ImageHandle, OpenFlags};

fn disk_type_name(disk_type: DiskType) -> &'static str {
    match disk_type {
        DiskType::Unknown => "unknown",
        DiskType::TwoGbExtentFlat => "two GB extent flat",
        DiskType::TwoGbExtentSparse => "two GB extent sparse",
        DiskType::Custom => "custom",
        DiskType::Device => "full device",
        DiskType::DevicePartitioned => "partitioned device",
        DiskType::MonolithicFlat => "monolithic flat",
        DiskType::MonolithicSparse => "monolithic sparse",
        DiskType::StreamOptimized => "stream optimized",
        DiskType::VmfsFlat => "VMFS flat",
        DiskType::VmfsFlatPreallocated => "VMFS flat preallocated",
        DiskType::VmfsFlatZeroed => "VMFS flat zeroed",
        DiskType::VmfsRaw => "VMFS raw",
        DiskType::VmfsRdm => "VMFS raw device mapping",
        DiskType::VmfsRdmp => "VMFS raw device mapping (passthrough)",
        DiskType::VmfsSparse => "VMFS sparse",
        DiskType::VmfsSparseThin => "VMFS sparse thin",
        DiskType::VmfsSparse2Gb => "VMFS sparse (2 GB extents)",
    }
}

fn main() {
    env_logger::init();

    let matches = Command::new("vmdkinfo")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Shows information obtained from a VMware Virtual Disk (VMDK) image.")
        .arg(
            Arg::new("input")
                .help("the path of the VMDK descriptor or monolithic sparse file")
                .required(true),
        )
        .get_matches();

    let input = matches.get_one::<String>("input").expect("required");

    let image = match ImageHandle::open(input, OpenFlags::read_only()) {
        Ok(image) => image,
        Err(err) => {
            eprintln!("vmdkinfo: unable to open image: {}", err);
            std::process::exit(1);
        }
    };

    println!("vmdkinfo {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("VMware Virtual Disk (VMDK) information:");
    println!("\tDisk type:\t\t{}", disk_type_name(image.get_disk_type()));
    println!("\tMedia size:\t\t{} bytes", image.get_media_size());
    println!("\tContent identifier:\t{:08x}", image.get_content_identifier());
    println!(
        "\tParent content identifier:\t{:08x}",
        image.get_parent_content_identifier()
    );
    if let Some(parent) = image.get_parent_filename() {
        println!("\tParent filename:\t{}", parent);
    }
    println!("\tNumber of extents:\t{}", image.get_number_of_extents());
    for i in 0..image.get_number_of_extents() {
        if let Ok(extent) = image.get_extent_descriptor(i) {
            println!(
                "\t  extent {}: {:?} {:?} {} sectors {}",
                i,
                extent.access_mode,
                extent.storage_kind,
                extent.nominal_size_sectors,
                extent.filename.as_deref().unwrap_or("-"),
            );
        }
    }
}
