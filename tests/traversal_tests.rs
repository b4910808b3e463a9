use binform::record::TableSource;
use binform::sink::{MemoryBuffer, MemoryWriterFactory};
use binform::{
    BinaryWriter, DataWriter, Encoder, Entry, Error, MemoryCounter, Options, Result, Template,
    Traverser,
};
use std::cell::Cell;
use std::path::Path;
use std::rc::Rc;

fn template(xml: &str) -> Template {
    Template::parse(xml).unwrap()
}

fn no_records() -> TableSource {
    TableSource::new(Vec::<String>::new())
}

/// Walks `entry` into one in-memory sink and returns its bytes.
fn walk_with(traverser: &Traverser, encoder: Rc<Encoder>, entry: Entry, combined: Vec<Entry>) -> Result<Vec<u8>> {
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer.clone(), encoder);
    let sinks = traverser
        .traverse(Some(Box::new(writer)), entry, combined)
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(sinks.len(), 1);
    Ok(buffer.bytes())
}

fn walk(xml: &str, records: TableSource, combined: Vec<Entry>) -> Result<Vec<u8>> {
    let encoder = Rc::new(Encoder::new(Options::new()));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
    walk_with(&traverser, encoder, Entry::new(template(xml)).with_records(records), combined)
}

fn combined_doc(xml: &str, column: &str, rows: &[&str]) -> Entry {
    let records = rows
        .iter()
        .fold(TableSource::new([column]), |table, row| table.with_row([*row]));
    Entry::new(template(xml)).with_records(records)
}

#[test]
fn test_fixed_count_ignores_records() {
    let records = TableSource::new(["x"]).with_row(["1"]).with_row(["2"]);
    let bytes = walk(
        "<format><item><default-value>H</default-value></item>\
         <repeat max='3'><item><default-value>V</default-value></item></repeat>\
         <item><default-value>T</default-value></item></format>",
        records,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"HVVVT");
}

#[test]
fn test_fetching_loop_reads_every_record() {
    let records = TableSource::new(["row/n"])
        .with_row(["1"])
        .with_row(["2"])
        .with_row(["3"]);
    let bytes = walk(
        "<format><item><default-value>H</default-value></item>\
         <repeat name='row' fetch='true'><item name='n'/></repeat>\
         <item name='row/n'/></format>",
        records,
        Vec::new(),
    )
    .unwrap();
    // The record current before the loop is restored after it.
    assert_eq!(bytes, b"H1231");
}

#[test]
fn test_fetching_loop_respects_max() {
    let records = TableSource::new(["n"])
        .with_row(["1"])
        .with_row(["2"])
        .with_row(["3"]);
    let bytes = walk(
        "<format><repeat fetch='true' max='2'><item name='n'/></repeat></format>",
        records,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"12");
}

#[test]
fn test_unrolled_loop_leaves_numbered_copies() {
    let encoder = Rc::new(Encoder::new(Options::new()));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
    let template = template(
        "<format><repeat name='r' max='3' unrolling='true'><item><default-value>V</default-value></item></repeat></format>",
    );
    let root = template.root;
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer.clone(), encoder);
    let mut walk = traverser.traverse(Some(Box::new(writer)), Entry::new(template), Vec::new());
    assert!(walk.next().unwrap().is_ok());
    assert!(walk.next().is_none());
    assert_eq!(buffer.bytes(), b"VVV");

    let tree = walk.tree();
    let copies: Vec<_> = tree.children(root).to_vec();
    assert_eq!(copies.len(), 3);
    let seqs: Vec<_> = copies.iter().map(|&c| tree.state(c).seq).collect();
    assert_eq!(seqs, vec![Some(0), Some(1), Some(2)]);
    assert!(copies
        .iter()
        .all(|&c| tree.state(c).repeat_id == tree.state(root_child(tree, root)).repeat_id));
}

fn root_child(tree: &binform::Tree, root: binform::NodeId) -> binform::NodeId {
    tree.first_child(root).unwrap()
}

#[test]
fn test_lazy_length_prefix() {
    let records = TableSource::new(["s"]).with_row(["hello"]);
    let bytes = walk(
        "<format>\
           <item bytes='1' encoding='decimal' eval='lazy'>\
             <default-value type='xpath'>sum(../item[@name='s']/@result-bytes)</default-value>\
           </item>\
           <item name='s'/>\
         </format>",
        records,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"\x05hello");
}

#[test]
fn test_lazy_fields_inside_loop() {
    let records = TableSource::new(["s"]).with_row(["abc"]);
    let bytes = walk(
        "<format><repeat max='2'>\
           <item bytes='1' encoding='decimal' eval='lazy'>\
             <default-value type='xpath'>sum(../item[@name='s']/@result-bytes)</default-value>\
           </item>\
           <item name='s'/>\
         </repeat></format>",
        records,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, b"\x03abc\x03abc");
}

#[test]
fn test_lazy_fields_in_unrolled_fetch() {
    let records = TableSource::new(["r/s"]).with_row(["a"]).with_row(["abc"]);
    let bytes = walk(
        "<format><repeat name='r' fetch='true' unrolling='true'>\
           <item bytes='1' encoding='decimal' eval='lazy'>\
             <default-value type='xpath'>sum(../item[@name='s']/@result-bytes)</default-value>\
           </item>\
           <item name='s'/>\
         </repeat></format>",
        records,
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, vec![1, b'a', 3, b'a', b'b', b'c']);
}

#[test]
fn test_auto_increment_across_iterations() {
    let bytes = walk(
        "<format><repeat max='3'><item bytes='1' encoding='decimal'>\
           <default-value type='auto-increment'>5</default-value>\
         </item></repeat></format>",
        no_records(),
        Vec::new(),
    )
    .unwrap();
    assert_eq!(bytes, [5, 6, 7]);
}

#[test]
fn test_counter_values() {
    let encoder = Rc::new(Encoder::new(Options::new()).with_counter(MemoryCounter::new().with_default(10)));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
    let entry = Entry::new(template(
        "<format><repeat max='2'><item><default-value type='counter'/></item></repeat></format>",
    ));
    assert_eq!(walk_with(&traverser, encoder, entry, Vec::new()).unwrap(), b"1011");
}

#[test]
fn test_combined_documents_are_walked_in_order() {
    let doc = "<format><item name='v'/></format>";
    let combined = vec![
        combined_doc(doc, "v", &["a"]),
        combined_doc(doc, "v", &["b"]),
        combined_doc(doc, "v", &["c"]),
    ];
    let bytes = walk(
        "<format><item><default-value>H</default-value></item>\
         <repeat type='combined-xml'><import type='combined'/></repeat>\
         <item><default-value>T</default-value></item></format>",
        no_records(),
        combined,
    )
    .unwrap();
    assert_eq!(bytes, b"HabcT");
}

#[test]
fn test_combined_records_cascade_into_documents() {
    let doc = "<format/>";
    let combined = vec![
        combined_doc(doc, "v", &["x", "y"]),
        combined_doc(doc, "v", &["z"]),
    ];
    let bytes = walk(
        "<format><repeat type='combined-xml'>\
           <repeat type='combined-record'><item type='combined' name='v'/></repeat>\
         </repeat></format>",
        no_records(),
        combined,
    )
    .unwrap();
    assert_eq!(bytes, b"xyz");
}

#[test]
fn test_combined_import_applies_edits() {
    let combined = vec![combined_doc(
        "<format><item name='v' bytes='4' rpadding='-'/></format>",
        "v",
        &["ab"],
    )];
    let bytes = walk(
        "<format><repeat type='combined-xml'>\
           <import type='combined'><map from=\"//item/@rpadding\" type='text'>*</map></import>\
         </repeat></format>",
        no_records(),
        combined,
    )
    .unwrap();
    assert_eq!(bytes, b"ab**");
}

#[test]
fn test_combined_import_needs_current_document() {
    let err = walk(
        "<format><import type='combined'/></format>",
        no_records(),
        Vec::new(),
    )
    .unwrap_err();
    assert!(err.is_format());
}

#[test]
fn test_combined_xml_without_progress_is_infinite() {
    let combined = vec![combined_doc("<format/>", "v", &["a"])];
    let err = walk(
        "<format><repeat type='combined-xml' fetch='false'><item/></repeat></format>",
        no_records(),
        combined,
    )
    .unwrap_err();
    assert!(err.is_infinite_loop());
}

#[test]
fn test_unbounded_repeat_never_runs_its_body() {
    let encoder = Rc::new(Encoder::new(Options::new()));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer.clone(), encoder);
    let entry = Entry::new(template(
        "<format><item><default-value>A</default-value></item><repeat><item><default-value>B</default-value></item></repeat></format>",
    ));
    let result: Result<Vec<_>> = traverser
        .traverse(Some(Box::new(writer)), entry, Vec::new())
        .collect();
    assert!(result.unwrap_err().is_infinite_loop());
    assert_eq!(buffer.bytes(), b"A");
}

#[test]
fn test_writer_rotation_per_record() {
    let records = TableSource::new(["r/file", "r/body"])
        .with_row(["one.bin", "1"])
        .with_row(["two.bin", "22"]);
    let factory = Rc::new(MemoryWriterFactory::new());
    let traverser = Traverser::new(Rc::new(Encoder::new(Options::new())), factory.clone());
    let entry = Entry::new(template(
        "<format><repeat name='r' fetch='true'>\
           <writer type='memory' key='r'><item name='file'/></writer>\
           <item name='body'/>\
         </repeat></format>",
    ))
    .with_records(records);

    let names: Vec<String> = traverser
        .traverse(None, entry, Vec::new())
        .map(|sink| sink.map(|sink| sink.name().to_string()))
        .collect::<Result<_>>()
        .unwrap();
    assert_eq!(names, ["one.bin", "two.bin"]);
    assert_eq!(factory.bytes("one.bin").unwrap(), b"1");
    assert_eq!(factory.bytes("two.bin").unwrap(), b"22");
}

#[test]
fn test_rotation_is_lazy() {
    let factory = Rc::new(MemoryWriterFactory::new());
    let traverser = Traverser::new(Rc::new(Encoder::new(Options::new())), factory.clone());
    let entry = Entry::new(template(
        "<format><writer type='memory'><item><default-value>a</default-value></item></writer>\
         <item><default-value>1</default-value></item>\
         <writer type='memory'><item><default-value>b</default-value></item></writer>\
         <item><default-value>2</default-value></item></format>",
    ));
    let mut walk = traverser.traverse(None, entry, Vec::new());
    assert!(factory.names().is_empty());

    let first = walk.next().unwrap().unwrap();
    assert_eq!(first.name(), "a");
    assert_eq!(factory.names(), ["a"]);

    let second = walk.next().unwrap().unwrap();
    assert_eq!(second.name(), "b");
    assert!(walk.next().is_none());
    assert_eq!(factory.bytes("b").unwrap(), b"2");
}

#[test]
fn test_writer_body_rejects_structure() {
    let err = walk(
        "<format><writer type='memory'><repeat max='1'><item/></repeat></writer></format>",
        no_records(),
        Vec::new(),
    )
    .unwrap_err();
    assert!(err.is_format());
}

#[test]
fn test_unknown_writer_type() {
    let err = walk(
        "<format><writer type='tape'><item><default-value>x</default-value></item></writer></format>",
        no_records(),
        Vec::new(),
    )
    .unwrap_err();
    assert!(err.is_input_data());
}

const PART: &str = "<format><item name='x' bytes='4' rpadding='.'/><item><default-value>?</default-value></item></format>";

fn importing_traverser(options: Options, loads: Rc<Cell<usize>>) -> (Traverser, Rc<Encoder>) {
    let encoder = Rc::new(Encoder::new(options));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()))
        .with_loader(move |path: &Path| -> Result<Template> {
            if path != Path::new("/parts/part.xml") {
                return Err(Error::input_data(format!("no such file {}", path.display()), None));
            }
            loads.set(loads.get() + 1);
            Template::parse(PART)
        });
    (traverser, encoder)
}

#[test]
fn test_static_import_with_edits() {
    let loads = Rc::new(Cell::new(0));
    let (traverser, encoder) =
        importing_traverser(Options::new().with_base_dir("/parts"), Rc::clone(&loads));
    let entry = Entry::new(template(
        "<format><item><default-value>[</default-value></item>\
           <import type='xml' target='part.xml' name='p'>\
             <map from=\"//item[@name='x']/@bytes\" type='text'>2</map>\
           </import>\
           <item><default-value>]</default-value></item></format>",
    ))
    .with_records(TableSource::new(["p/x"]).with_row(["abc"]));
    let bytes = walk_with(&traverser, encoder, entry, Vec::new()).unwrap();
    assert_eq!(bytes, b"[ab?]");
    assert_eq!(loads.get(), 1);
}

#[test]
fn test_dynamic_import_per_visit() {
    let loads = Rc::new(Cell::new(0));
    let options = Options::new()
        .with_base_dir("/parts")
        .with_external("mark", "!");
    let (traverser, encoder) = importing_traverser(options, Rc::clone(&loads));
    let entry = Entry::new(template(
        "<format><repeat max='2'>\
           <import type='dynamic' target='part.xml'>\
             <map from='//item/default-value' type='external'>mark</map>\
           </import>\
         </repeat></format>",
    ))
    .with_records(TableSource::new(["x"]).with_row(["ab"]));
    let bytes = walk_with(&traverser, encoder, entry, Vec::new()).unwrap();
    assert_eq!(bytes, b"ab..!ab..!");
    assert_eq!(loads.get(), 1);
}

/// Live arena size after walking `entry` to the end.
fn nodes_after_walk(traverser: &Traverser, encoder: Rc<Encoder>, entry: Entry) -> (usize, usize) {
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer, encoder);
    let mut walk = traverser.traverse(Some(Box::new(writer)), entry, Vec::new());
    for sink in walk.by_ref() {
        sink.unwrap();
    }
    (walk.tree().len(), walk.tree().capacity())
}

#[test]
fn test_dynamic_imports_do_not_grow_the_tree() {
    let sizes: Vec<_> = [10, 100, 1000]
        .iter()
        .map(|&rows| {
            let (traverser, encoder) = importing_traverser(
                Options::new().with_base_dir("/parts"),
                Rc::new(Cell::new(0)),
            );
            let records = (0..rows).fold(TableSource::new(["x"]), |table, _| table.with_row(["ab"]));
            let entry = Entry::new(template(
                "<format><repeat fetch='true'><import type='dynamic' target='part.xml'/></repeat></format>",
            ))
            .with_records(records);
            nodes_after_walk(&traverser, encoder, entry)
        })
        .collect();
    assert_eq!(sizes[0], sizes[1]);
    assert_eq!(sizes[1], sizes[2]);
}

#[test]
fn test_rewalked_unrolled_loops_do_not_grow_the_tree() {
    let sizes: Vec<_> = [2, 20, 200]
        .iter()
        .map(|&outer| {
            let encoder = Rc::new(Encoder::new(Options::new()));
            let traverser =
                Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
            let entry = Entry::new(template(&format!(
                "<format><repeat max='{}'>\
                   <repeat max='3' unrolling='true'><item><default-value>V</default-value></item></repeat>\
                 </repeat></format>",
                outer
            )));
            nodes_after_walk(&traverser, encoder, entry).0
        })
        .collect();
    assert_eq!(sizes[0], sizes[1]);
    assert_eq!(sizes[1], sizes[2]);
}

#[test]
fn test_missing_import_is_input_error() {
    let (traverser, encoder) =
        importing_traverser(Options::new().with_base_dir("/parts"), Rc::new(Cell::new(0)));
    let entry = Entry::new(template("<format><import type='xml' target='gone.xml'/></format>"));
    let err = walk_with(&traverser, encoder, entry, Vec::new()).unwrap_err();
    assert!(err.is_input_data());
}

#[test]
fn test_unknown_import_type() {
    let err = walk(
        "<format><import type='soap' target='x.xml'/></format>",
        no_records(),
        Vec::new(),
    )
    .unwrap_err();
    assert!(err.is_format());
    assert!(err.to_string().contains("soap"));
}

#[test]
fn test_failed_walk_keeps_earlier_bytes() {
    let encoder = Rc::new(Encoder::new(Options::new()));
    let traverser = Traverser::new(Rc::clone(&encoder), Rc::new(MemoryWriterFactory::new()));
    let buffer = MemoryBuffer::new();
    let writer = BinaryWriter::new(buffer.clone(), encoder);
    let entry = Entry::new(template(
        "<format><item><default-value>ok</default-value></item>\
         <item bytes='x'><default-value>bad</default-value></item></format>",
    ));
    let err = traverser
        .traverse(Some(Box::new(writer)), entry, Vec::new())
        .collect::<Result<Vec<_>>>()
        .unwrap_err();
    assert!(err.is_encoding());
    assert_eq!(buffer.bytes(), b"ok");
}

#[test]
fn test_sink_is_usable_as_trait_object() {
    let encoder = Rc::new(Encoder::new(Options::new()));
    let buffer = MemoryBuffer::new();
    let writer: Box<dyn DataWriter> = Box::new(BinaryWriter::new(buffer, encoder).with_name("out"));
    assert_eq!(writer.name(), "out");
    assert_eq!(writer.depth(), 0);
}
