//! End-to-end reads against a synthetic process image.

mod common;

use std::rc::Rc;

use common::write_structures;
use dfmem::process::testing::FakeProcess;
use dfmem::process::{ProcessCache, ProcessVectorizer};
use dfmem::reader::{
    downcast_pointee, CompoundSpec, PolymorphicDest, PolymorphicSpec, ReadArgs, ReadableStructure,
    ReadableUnion, UnionSpec, NO_ALTERNATIVE,
};
use dfmem::{
    structure_read_dest, union_read_dest, FlagArray, MemoryView, ReadError, ReadSession,
    ReaderFactory, Structures, TypedPointer,
};

const SCHEMA: &str = r#"<data-definition>
    <enum-type type-name="poem_subject" base-type="int32_t">
        <enum-item name="Histfig"/>
        <enum-item name="Concept"/>
    </enum-type>
    <struct-type type-name="unit">
        <int32_t name="id"/>
        <stl-string name="name"/>
        <stl-vector name="friends" pointer-type="unit"/>
        <df-flagarray name="flags"/>
        <int16_t name="level"/>
    </struct-type>
    <struct-type type-name="poem_target" is-union="true">
        <int32_t name="histfig"/>
        <int8_t name="topic"/>
    </struct-type>
    <struct-type type-name="poem">
        <enum name="subject" type-name="poem_subject"/>
        <compound name="target" type-name="poem_target"/>
    </struct-type>
    <class-type type-name="itemdef" original-name="itemdefst">
        <stl-string name="id"/>
        <virtual-methods>
            <vmethod is-destructor="true"/>
        </virtual-methods>
    </class-type>
    <class-type type-name="itemdef_weapon" inherits-from="itemdef"
            original-name="itemdef_weaponst">
        <int32_t name="damage"/>
    </class-type>
    <class-type type-name="itemdef_armor" inherits-from="itemdef"
            original-name="itemdef_armorst">
        <int32_t name="absorb"/>
    </class-type>
    <struct-type type-name="job">
        <int32_t name="id"/>
    </struct-type>
    <df-linked-list-type type-name="job_list_link" item-type="job"/>
    <struct-type type-name="world">
        <stl-vector name="units" pointer-type="unit"/>
        <pointer name="first_itemdef" type-name="itemdef"/>
        <pointer name="mystery_itemdef" type-name="itemdef"/>
        <pointer name="shared_a" type-name="unit"/>
        <pointer name="shared_b" type-name="unit"/>
        <compound name="jobs" type-name="job_list_link"/>
    </struct-type>
    <global-object name="world" type-name="world"/>
    <global-object name="the_poem" type-name="poem"/>
</data-definition>"#;

const SYMBOLS: &str = r#"<data-definition>
    <symbol-table name="v0.50.11 linux64">
        <md5-hash value="00112233445566778899aabbccddeeff"/>
        <global-address name="world" value="0x100000"/>
        <global-address name="the_poem" value="0x160000"/>
        <vtable-address name="itemdefst" value="0x200000"/>
        <vtable-address name="itemdef_weaponst" value="0x200100"/>
        <vtable-address name="itemdef_armorst" value="0x200200"/>
    </symbol-table>
</data-definition>"#;

const ID: [u8; 16] = [
    0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
    0xff,
];

// --------------------------------------------------------------------
// Destination structures

#[derive(Debug, Default)]
struct Unit {
    id: i32,
    name: String,
    friends: Vec<Option<Box<Unit>>>,
    flags: FlagArray,
    level: i16,
}

impl ReadableStructure for Unit {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("unit")
            .field("id", |unit: &mut Self| &mut unit.id)
            .field("name", |unit: &mut Self| &mut unit.name)
            .field("friends", |unit: &mut Self| &mut unit.friends)
            .field("flags", |unit: &mut Self| &mut unit.flags)
            .field("level", |unit: &mut Self| &mut unit.level)
    }
}
structure_read_dest!(Unit);

#[derive(Debug, Default, PartialEq)]
enum PoemTarget {
    #[default]
    None,
    Histfig(i32),
    Topic(i8),
}

impl ReadableUnion for PoemTarget {
    fn spec() -> UnionSpec<Self> {
        UnionSpec::union("poem_target")
            .alternative::<i32>(|out, value| *out = PoemTarget::Histfig(value))
            .alternative::<i8>(|out, value| *out = PoemTarget::Topic(value))
    }
}
union_read_dest!(PoemTarget);

#[derive(Debug, Default)]
struct Poem {
    subject: i32,
    target: PoemTarget,
}

impl ReadableStructure for Poem {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::sequenced("poem")
            .field("subject", |poem: &mut Self| &mut poem.subject)
            .field_with(
                "target",
                |poem: &mut Self| &mut poem.target,
                |poem: &Poem| match poem.subject {
                    0 => ReadArgs::Alternative(0),
                    1 => ReadArgs::Alternative(1),
                    _ => ReadArgs::Alternative(NO_ALTERNATIVE),
                },
            )
    }
}
structure_read_dest!(Poem);

#[derive(Debug, Default)]
struct ItemDef {
    vtable: usize,
    id: String,
}

impl ReadableStructure for ItemDef {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("itemdef")
            .vtable(|def: &mut Self| &mut def.vtable)
            .field("id", |def: &mut Self| &mut def.id)
    }
}
structure_read_dest!(ItemDef);

#[derive(Debug, Default)]
struct ItemDefWeapon {
    base: ItemDef,
    damage: i32,
}

impl ReadableStructure for ItemDefWeapon {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("itemdef_weapon")
            .base(|def: &mut Self| &mut def.base)
            .field("damage", |def: &mut Self| &mut def.damage)
    }
}
structure_read_dest!(ItemDefWeapon);

#[derive(Debug, Default)]
struct ItemDefArmor {
    base: ItemDef,
    absorb: i32,
}

impl ReadableStructure for ItemDefArmor {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("itemdef_armor")
            .base(|def: &mut Self| &mut def.base)
            .field("absorb", |def: &mut Self| &mut def.absorb)
    }
}
structure_read_dest!(ItemDefArmor);

#[derive(Debug)]
enum AnyItemDef {
    Base(ItemDef),
    Weapon(ItemDefWeapon),
    Armor(ItemDefArmor),
}

impl PolymorphicDest for AnyItemDef {
    fn spec() -> PolymorphicSpec<Self> {
        PolymorphicSpec::with_base::<ItemDef>(AnyItemDef::Base, |any| match any {
            AnyItemDef::Base(def) => Ok(def),
            other => Err(other),
        })
        .variant::<ItemDefWeapon>(AnyItemDef::Weapon, |any| match any {
            AnyItemDef::Weapon(def) => Ok(def),
            other => Err(other),
        })
        .variant::<ItemDefArmor>(AnyItemDef::Armor, |any| match any {
            AnyItemDef::Armor(def) => Ok(def),
            other => Err(other),
        })
    }
}

impl dfmem::ReadDest for AnyItemDef {
    fn make_reader(
        _factory: &ReaderFactory<'_>,
        _ty: dfmem::TypeId,
    ) -> Result<dfmem::reader::ItemReader<Self>, dfmem::TypeError> {
        Err(dfmem::TypeError::with_name(
            "itemdef",
            std::any::type_name::<Self>(),
            "polymorphic type must be read through a pointer",
        ))
    }

    fn make_pointee(
        factory: &ReaderFactory<'_>,
        pointer: dfmem::TypeId,
    ) -> Result<Rc<dyn dfmem::reader::PointeeRead<Self>>, dfmem::TypeError> {
        dfmem::reader::polymorphic_pointee::<Self>(factory, pointer)
    }
}

#[derive(Debug, Default)]
struct Job {
    id: i32,
}

impl ReadableStructure for Job {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("job").field("id", |job: &mut Self| &mut job.id)
    }
}
structure_read_dest!(Job);

#[derive(Default)]
struct World {
    units: Vec<Option<Box<Unit>>>,
    first_itemdef: Option<Box<AnyItemDef>>,
    mystery_itemdef: Option<Box<AnyItemDef>>,
    shared_a: Option<Rc<Unit>>,
    shared_b: Option<Rc<Unit>>,
    jobs: Vec<Option<Box<Job>>>,
}

impl ReadableStructure for World {
    fn spec() -> CompoundSpec<Self> {
        CompoundSpec::structure("world")
            .field("units", |world: &mut Self| &mut world.units)
            .field("first_itemdef", |world: &mut Self| &mut world.first_itemdef)
            .field("mystery_itemdef", |world: &mut Self| {
                &mut world.mystery_itemdef
            })
            .field("shared_a", |world: &mut Self| &mut world.shared_a)
            .field("shared_b", |world: &mut Self| &mut world.shared_b)
            .field("jobs", |world: &mut Self| &mut world.jobs)
    }
}
structure_read_dest!(World);

// --------------------------------------------------------------------
// Image construction

fn load_structures() -> Structures {
    let dir = write_structures(&[("df.test.xml", SCHEMA), ("symbols.xml", SYMBOLS)]);
    Structures::load(dir.path()).expect("load structures")
}

/// Write an inline (SSO) libstdc++ string object at `address`.
fn write_sso_string(process: &FakeProcess, address: usize, text: &str) {
    assert!(text.len() <= 15);
    process.write_ptr(address, address + 16);
    process.write_u64(address + 8, text.len() as u64);
    process.write(address + 16, text.as_bytes());
}

/// Write a vector header `{begin, end, end_capacity}` at `address`.
fn write_vector(process: &FakeProcess, address: usize, begin: usize, len: usize, stride: usize) {
    process.write_ptr(address, begin);
    process.write_ptr(address + 8, begin + len * stride);
    process.write_ptr(address + 16, begin + len * stride);
}

fn write_unit(
    process: &FakeProcess,
    address: usize,
    id: i32,
    name: &str,
    flags_bits: usize,
    flags_len: u32,
    level: i16,
) {
    process.write_u32(address, id as u32);
    write_sso_string(process, address + 8, name);
    write_vector(process, address + 40, 0, 0, 8);
    process.write_ptr(address + 64, flags_bits);
    process.write_u32(address + 72, flags_len);
    process.write_u16(address + 80, level as u16);
}

/// Build the target image, relocated by `off`. Returns the process with
/// every touched page fully mapped (zero-filled first), so the image
/// also works behind the page cache.
fn build_image(off: usize) -> FakeProcess {
    let process = FakeProcess::with_base_offset(ID.to_vec(), off as isize);
    for page in [
        0x100000, 0x110000, 0x111000, 0x120000, 0x130000, 0x140000, 0x150000, 0x160000,
    ] {
        process.write(page + off, &[0u8; 4096]);
    }

    let world = 0x100000 + off;
    // world.units: two unit pointers.
    write_vector(&process, world, 0x110000 + off, 2, 8);
    process.write_ptr(0x110000 + off, 0x120000 + off);
    process.write_ptr(0x110008 + off, 0x120400 + off);
    // world.first_itemdef / mystery_itemdef.
    process.write_ptr(world + 24, 0x140000 + off);
    process.write_ptr(world + 32, 0x140100 + off);
    // world.shared_a / shared_b: same target.
    process.write_ptr(world + 40, 0x120800 + off);
    process.write_ptr(world + 48, 0x120800 + off);
    // world.jobs: embedded list header, only next is set.
    process.write_ptr(world + 56 + 16, 0x150000 + off);

    // Units.
    write_unit(&process, 0x120000 + off, 7, "Urist", 0x130000 + off, 3, 3);
    process.write(0x130000 + off, &[0xa5, 0x00, 0xff]);
    write_unit(&process, 0x120400 + off, 9, "Bomrek", 0x130000 + off, 1, -2);
    // Bomrek's friends: one pointer back to Urist.
    write_vector(&process, 0x120400 + off + 40, 0x111000 + off, 1, 8);
    process.write_ptr(0x111000 + off, 0x120000 + off);
    write_unit(&process, 0x120800 + off, 1, "Shared", 0x130000 + off, 0, 0);

    // Item definitions: vtable word, id string, payload.
    process.write_ptr(0x140000 + off, 0x200100 + off);
    write_sso_string(&process, 0x140008 + off, "AXE");
    process.write_u32(0x140028 + off, 42);

    process.write_ptr(0x140100 + off, 0x999999 + off);
    write_sso_string(&process, 0x140108 + off, "MYSTERY");

    process.write_ptr(0x140200 + off, 0x200200 + off);
    write_sso_string(&process, 0x140208 + off, "MAIL");
    process.write_u32(0x140228 + off, 5);

    // Job list: two nodes.
    let node1 = 0x150000 + off;
    let node2 = 0x150040 + off;
    process.write_ptr(node1, 0x150100 + off);
    process.write_ptr(node1 + 8, world + 56);
    process.write_ptr(node1 + 16, node2);
    process.write_ptr(node2, 0x150140 + off);
    process.write_ptr(node2 + 8, node1);
    process.write_ptr(node2 + 16, 0);
    process.write_u32(0x150100 + off, 11);
    process.write_u32(0x150140 + off, 22);

    // the_poem: subject = Concept, topic = 77.
    process.write_u32(0x160000 + off, 1);
    process.write_u8(0x160004 + off, 77);
    // A second poem image: subject = Histfig, histfig = -5.
    process.write_u32(0x160010 + off, 0);
    process.write_u32(0x160014 + off, (-5i32) as u32);
    // A third: unknown subject.
    process.write_u32(0x160020 + off, 9);
    process.write_u32(0x160024 + off, 0xdead_beef);

    process
}

fn check_world(world: &World, off: usize) {
    assert_eq!(world.units.len(), 2);
    let urist = world.units[0].as_ref().expect("first unit");
    assert_eq!(urist.id, 7);
    assert_eq!(urist.name, "Urist");
    assert_eq!(urist.level, 3);
    assert!(urist.friends.is_empty());
    // S6: 0xA5 0x00 0xFF, 3 bytes -> 24 bits.
    let expected: Vec<bool> = [
        1, 0, 1, 0, 0, 1, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1,
    ]
    .iter()
    .map(|&bit| bit == 1)
    .collect();
    assert_eq!(urist.flags.0, expected);

    let bomrek = world.units[1].as_ref().expect("second unit");
    assert_eq!(bomrek.id, 9);
    assert_eq!(bomrek.name, "Bomrek");
    assert_eq!(bomrek.level, -2);
    assert_eq!(bomrek.friends.len(), 1);
    assert_eq!(bomrek.friends[0].as_ref().map(|f| f.id), Some(7));

    // P9: the vtable word picks the concrete variant.
    match world.first_itemdef.as_deref() {
        Some(AnyItemDef::Weapon(weapon)) => {
            assert_eq!(weapon.base.id, "AXE");
            assert_eq!(weapon.base.vtable, 0x200100 + off);
            assert_eq!(weapon.damage, 42);
        }
        other => panic!("expected a weapon, got {other:?}"),
    }
    // Unknown vtable falls back to the concrete base.
    match world.mystery_itemdef.as_deref() {
        Some(AnyItemDef::Base(base)) => assert_eq!(base.id, "MYSTERY"),
        other => panic!("expected base fallback, got {other:?}"),
    }

    // P8: shared pointers to one address are one object.
    let a = world.shared_a.as_ref().expect("shared_a");
    let b = world.shared_b.as_ref().expect("shared_b");
    assert!(Rc::ptr_eq(a, b));
    assert_eq!(a.name, "Shared");

    // Linked list items in walk order.
    let jobs: Vec<i32> = world
        .jobs
        .iter()
        .map(|job| job.as_ref().expect("job item").id)
        .collect();
    assert_eq!(jobs, vec![11, 22]);
}

// --------------------------------------------------------------------
// Tests

#[test]
fn read_world_end_to_end() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0);
    let probe = process.clone();

    {
        let session = ReadSession::new(&factory, &process).unwrap();
        assert!(probe.is_stopped());
        let mut world = World::default();
        assert!(session.read_global_sync("world", &mut world));
        check_world(&world, 0);
    }
    // The session resumed the target on drop.
    assert!(!probe.is_stopped());
    assert_eq!(probe.stop_count(), 1);
    assert_eq!(probe.cont_count(), 1);
}

#[test]
fn read_world_through_cache_and_vectorizer() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let fake = build_image(0);
    let probe = fake.clone();
    let stack = ProcessCache::new(Box::new(ProcessVectorizer::new(Box::new(fake), 1 << 20)));

    let session = ReadSession::new(&factory, &stack).unwrap();
    let mut world = World::default();
    assert!(session.read_global_sync("world", &mut world));
    check_world(&world, 0);

    // Everything went through coalesced page reads.
    assert_eq!(probe.read_count(), 0);
    assert!(!probe.batches().is_empty());
}

#[test]
fn base_offset_is_applied_to_globals_and_vtables() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0x2000);

    let session = ReadSession::new(&factory, &process).unwrap();
    let mut world = World::default();
    assert!(session.read_global_sync("world", &mut world));
    check_world(&world, 0x2000);
}

#[test]
fn reader_size_matches_layout_size() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();

    for name in ["unit", "world", "itemdef", "itemdef_weapon", "poem"] {
        let id = structures.find_compound(name).unwrap();
        let info = factory.layout.type_info(id).unwrap();
        match name {
            "unit" => {
                let reader = factory.item_reader::<Unit>(id).unwrap();
                assert_eq!(reader.size(), info.size);
            }
            "world" => {
                let reader = factory.item_reader::<World>(id).unwrap();
                assert_eq!(reader.size(), info.size);
            }
            "itemdef" => {
                let reader = factory.compound_reader::<ItemDef>().unwrap();
                assert_eq!(reader.info().size, info.size);
            }
            "itemdef_weapon" => {
                let reader = factory.compound_reader::<ItemDefWeapon>().unwrap();
                assert_eq!(reader.info().size, info.size);
            }
            "poem" => {
                let reader = factory.item_reader::<Poem>(id).unwrap();
                assert_eq!(reader.size(), info.size);
            }
            _ => unreachable!(),
        }
    }
}

#[test]
fn union_reads_follow_the_discriminator() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0);
    let session = ReadSession::new(&factory, &process).unwrap();

    let mut poem = Poem::default();
    assert!(session.read_global_sync("the_poem", &mut poem));
    assert_eq!(poem.subject, 1);
    assert_eq!(poem.target, PoemTarget::Topic(77));

    let poem_ty = structures.find_global_type("the_poem").unwrap();
    let mut second = Poem::default();
    assert!(session.read_sync(
        TypedPointer {
            address: 0x160010,
            ty: poem_ty,
        },
        &mut second,
    ));
    assert_eq!(second.subject, 0);
    assert_eq!(second.target, PoemTarget::Histfig(-5));

    // Out-of-range subjects read no alternative, without error.
    let mut third = Poem::default();
    assert!(session.read_sync(
        TypedPointer {
            address: 0x160020,
            ty: poem_ty,
        },
        &mut third,
    ));
    assert_eq!(third.subject, 9);
    assert_eq!(third.target, PoemTarget::None);
}

#[test]
fn union_rejects_out_of_range_discriminators() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0);
    let session = ReadSession::new(&factory, &process).unwrap();

    let reader = factory.union_reader::<PoemTarget>().unwrap();
    let bytes = [0u8; 4];
    let mut out = PoemTarget::default();
    let task = reader.read(&session, MemoryView::new(0, &bytes), &mut out, 5);
    let mut result = None;
    session.process().sync(Box::pin(async {
        result = Some(task.await);
    }));
    assert!(matches!(
        result,
        Some(Err(ReadError::InvalidDiscriminator(5)))
    ));
}

#[test]
fn downcast_pointers_check_the_concrete_type() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0);
    let session = ReadSession::new(&factory, &process).unwrap();

    let world_ty = structures.find_global_type("world").unwrap();
    let (pointer_ty, _) = factory
        .layout
        .offset_of(
            &structures,
            world_ty,
            &dfmem::path::parse("first_itemdef").unwrap(),
        )
        .unwrap();
    let pointee = downcast_pointee::<AnyItemDef, ItemDefWeapon>(&factory, pointer_ty).unwrap();

    let mut weapon = None;
    let mut cast_error = None;
    session.process().sync(Box::pin(async {
        weapon = Some(pointee.read_unique(&session, 0x140000).await);
        cast_error = Some(pointee.read_unique(&session, 0x140200).await);
    }));

    let weapon = weapon.unwrap().unwrap().expect("weapon present");
    assert_eq!(weapon.base.id, "AXE");
    assert_eq!(weapon.damage, 42);
    assert!(matches!(cast_error, Some(Err(ReadError::CastError))));
}

#[test]
fn version_mismatch_refuses_the_session() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = FakeProcess::new(vec![1, 2, 3, 4]);

    match ReadSession::new(&factory, &process) {
        Err(ReadError::VersionMismatch { id, known }) => {
            assert_eq!(id, "01020304");
            assert_eq!(known, vec!["v0.50.11 linux64".to_owned()]);
        }
        other => panic!("expected a version mismatch, got {:?}", other.is_ok()),
    }
    // No stop was attempted.
    assert_eq!(process.stop_count(), 0);
}

#[test]
fn vector_invariant_violations_fail_the_read() {
    let structures = load_structures();
    let version = structures.version_by_name("v0.50.11 linux64").unwrap();
    let factory = ReaderFactory::new(&structures, version).unwrap();
    let process = build_image(0);
    // Corrupt world.units: end < begin.
    process.write_ptr(0x100000, 0x110010);
    process.write_ptr(0x100008, 0x110000);
    process.write_ptr(0x100010, 0x110010);

    let session = ReadSession::new(&factory, &process).unwrap();
    let mut world = World::default();
    assert!(!session.read_global_sync("world", &mut world));
}
